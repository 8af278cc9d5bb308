use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::sync::Synchronizer;

/// Background task that pulls external calendars every `interval`.
pub async fn run_calendar_sync(engine: Arc<Engine>, sync: Arc<Synchronizer>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let today = Utc::now().date_naive();
        match sync.run(&engine, today).await {
            Ok(report) if !report.failures.is_empty() => {
                warn!(failed = report.failures.len(), feeds = report.feeds, "calendar sync finished with failures");
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "calendar sync aborted"),
        }
    }
}

/// Background task that compacts the journal once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut ticker = tokio::time::interval(Duration::from_secs(30));
    loop {
        ticker.tick().await;
        if threshold == 0 || engine.journal_appends_since_compact().await < threshold {
            continue;
        }
        match engine.compact().await {
            Ok(events) => info!(events, "compaction finished"),
            Err(e) => warn!(error = %e, "compaction failed, will retry"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use rust_decimal::Decimal;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("innkeep_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compactor_runs_past_threshold() {
        let path = test_wal_path("compactor.wal");
        let engine = Arc::new(Engine::new(&path).unwrap());
        let property = Ulid::new();
        engine
            .create_property(Property {
                id: property,
                name: "corner-house".into(),
                check_in_time: None,
                check_out_time: None,
                whole_property_rate: Some(Decimal::from(400)),
            })
            .await
            .unwrap();
        for i in 0..3 {
            let mut p = engine.property(&property).await.unwrap();
            p.name = format!("corner-house-{i}");
            engine.update_property(p).await.unwrap();
        }
        assert_eq!(engine.journal_appends_since_compact().await, 4);

        // the first tick fires immediately
        let task = tokio::spawn(run_compactor(engine.clone(), 2));
        let compacted = tokio::time::timeout(Duration::from_secs(5), async {
            while engine.journal_appends_since_compact().await != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        task.abort();
        assert!(compacted.is_ok(), "compactor never ran");
        let reopened = Engine::new(&path).unwrap();
        assert_eq!(reopened.property(&property).await.unwrap().name, "corner-house-2");
    }
}
