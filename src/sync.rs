//! Pulls every room's external calendar feeds and records their holds as
//! blocked stays. One bad feed never stops the others.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::{StreamExt, stream};
use serde::Serialize;
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::engine::{BlockInsert, Engine, EngineError};
use crate::ical;
use crate::limits::MAX_FEED_BYTES;
use crate::model::FeedSubscription;
use crate::observability;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    Fetch(String),
    Status(u16),
    Timeout,
    TooLarge,
    Parse(String),
}

impl FeedError {
    /// Metric label.
    pub fn reason(&self) -> &'static str {
        match self {
            FeedError::Fetch(_) => "fetch",
            FeedError::Status(_) => "status",
            FeedError::Timeout => "timeout",
            FeedError::TooLarge => "too_large",
            FeedError::Parse(_) => "parse",
        }
    }
}

impl fmt::Display for FeedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedError::Fetch(e) => write!(f, "fetch failed: {e}"),
            FeedError::Status(code) => write!(f, "feed answered HTTP {code}"),
            FeedError::Timeout => write!(f, "feed timed out"),
            FeedError::TooLarge => write!(f, "feed larger than {MAX_FEED_BYTES} bytes"),
            FeedError::Parse(e) => write!(f, "feed is not valid iCalendar: {e}"),
        }
    }
}

impl std::error::Error for FeedError {}

/// Where feed bodies come from.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, FeedError>;
}

pub struct HttpFeedFetcher {
    client: reqwest::Client,
}

impl HttpFeedFetcher {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("innkeep/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

fn fetch_error(e: reqwest::Error) -> FeedError {
    if e.is_timeout() {
        FeedError::Timeout
    } else {
        FeedError::Fetch(e.to_string())
    }
}

#[async_trait]
impl FeedFetcher for HttpFeedFetcher {
    async fn fetch(&self, url: &str) -> Result<String, FeedError> {
        let mut response = self.client.get(url).send().await.map_err(fetch_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Status(status.as_u16()));
        }
        if response
            .content_length()
            .is_some_and(|len| len > MAX_FEED_BYTES as u64)
        {
            return Err(FeedError::TooLarge);
        }
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(fetch_error)? {
            if body.len() + chunk.len() > MAX_FEED_BYTES {
                return Err(FeedError::TooLarge);
            }
            body.extend_from_slice(&chunk);
        }
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedFailure {
    pub feed_id: Ulid,
    pub room_id: Ulid,
    pub url: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub feeds: usize,
    pub blocks_inserted: usize,
    pub already_blocked: usize,
    /// Events already over, or without a usable date range.
    pub events_skipped: usize,
    pub blocks_purged: usize,
    pub failures: Vec<FeedFailure>,
}

#[derive(Default)]
struct FeedTally {
    inserted: usize,
    already_blocked: usize,
    skipped: usize,
}

pub struct Synchronizer {
    fetcher: Arc<dyn FeedFetcher>,
    concurrency: usize,
    timeout: Duration,
    /// One run at a time, whether scheduled or triggered by hand.
    running: Mutex<()>,
}

impl Synchronizer {
    pub fn new(fetcher: Arc<dyn FeedFetcher>, concurrency: usize, timeout: Duration) -> Self {
        Self {
            fetcher,
            concurrency: concurrency.max(1),
            timeout,
            running: Mutex::new(()),
        }
    }

    /// Purge blocks that have ended, then pull every feed.
    pub async fn run(&self, engine: &Engine, today: NaiveDate) -> Result<SyncReport, EngineError> {
        let _running = self.running.lock().await;
        let started = Instant::now();
        let mut report = SyncReport {
            blocks_purged: engine.purge_stale_blocks(today).await?,
            ..SyncReport::default()
        };

        let feeds = engine.feed_subscriptions().await;
        report.feeds = feeds.len();

        let fetched: Vec<(FeedSubscription, Result<String, FeedError>)> = stream::iter(feeds)
            .map(|feed| async move {
                let body = match tokio::time::timeout(self.timeout, self.fetcher.fetch(&feed.url)).await {
                    Ok(result) => result,
                    Err(_) => Err(FeedError::Timeout),
                };
                (feed, body)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (feed, body) in fetched {
            let outcome = match body {
                Ok(text) => apply_feed(engine, &feed, &text, today).await,
                Err(e) => {
                    metrics::counter!(observability::FEED_FAILURES, "reason" => e.reason())
                        .increment(1);
                    Err(e.to_string())
                }
            };
            match outcome {
                Ok(tally) => {
                    report.blocks_inserted += tally.inserted;
                    report.already_blocked += tally.already_blocked;
                    report.events_skipped += tally.skipped;
                }
                Err(reason) => {
                    tracing::warn!(room = %feed.room_id, url = %feed.url, %reason, "calendar feed failed");
                    report.failures.push(FeedFailure {
                        feed_id: feed.id,
                        room_id: feed.room_id,
                        url: feed.url,
                        reason,
                    });
                }
            }
        }

        metrics::histogram!(observability::SYNC_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        tracing::info!(
            feeds = report.feeds,
            failed = report.failures.len(),
            inserted = report.blocks_inserted,
            purged = report.blocks_purged,
            "calendar sync finished"
        );
        Ok(report)
    }
}

/// Record every current event of one feed. A write failure abandons the rest
/// of this feed; blocks already written stay.
async fn apply_feed(
    engine: &Engine,
    feed: &FeedSubscription,
    text: &str,
    today: NaiveDate,
) -> Result<FeedTally, String> {
    let parsed = ical::parse_feed(text).map_err(|e| {
        metrics::counter!(observability::FEED_FAILURES, "reason" => "parse").increment(1);
        FeedError::Parse(e).to_string()
    })?;
    let mut tally = FeedTally {
        skipped: parsed.skipped,
        ..FeedTally::default()
    };
    for event in parsed.events {
        if event.stay.check_out < today {
            tally.skipped += 1;
            continue;
        }
        match engine.insert_block(feed.room_id, event.stay).await {
            Ok(BlockInsert::Inserted(_)) => tally.inserted += 1,
            Ok(BlockInsert::AlreadyBlocked) => tally.already_blocked += 1,
            Err(e) => {
                metrics::counter!(observability::FEED_FAILURES, "reason" => "write").increment(1);
                return Err(format!("recording {} failed: {e}", event.stay));
            }
        }
    }
    Ok(tally)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rust_decimal::Decimal;

    use super::*;
    use crate::model::*;

    struct FakeFetcher {
        bodies: HashMap<String, Result<String, FeedError>>,
        delay: Duration,
    }

    #[async_trait]
    impl FeedFetcher for FakeFetcher {
        async fn fetch(&self, url: &str) -> Result<String, FeedError> {
            tokio::time::sleep(self.delay).await;
            self.bodies
                .get(url)
                .cloned()
                .unwrap_or(Err(FeedError::Status(404)))
        }
    }

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn feed(events: &[(&str, &str)]) -> String {
        let mut text = String::from("BEGIN:VCALENDAR\r\nVERSION:2.0\r\n");
        for (i, (start, end)) in events.iter().enumerate() {
            text.push_str(&format!(
                "BEGIN:VEVENT\r\nUID:ev-{i}\r\nDTSTART;VALUE=DATE:{start}\r\nDTEND;VALUE=DATE:{end}\r\nEND:VEVENT\r\n"
            ));
        }
        text.push_str("END:VCALENDAR\r\n");
        text
    }

    async fn engine_with_rooms(feeds: &[(&str, usize)]) -> (Engine, Vec<Ulid>) {
        let engine = Engine::in_memory();
        let property = Ulid::new();
        engine
            .create_property(Property {
                id: property,
                name: "corner-house".into(),
                check_in_time: None,
                check_out_time: None,
                whole_property_rate: None,
            })
            .await
            .unwrap();
        let rooms = vec![Ulid::new(), Ulid::new()];
        for (i, id) in rooms.iter().enumerate() {
            engine
                .create_room(Room {
                    id: *id,
                    property_id: property,
                    name: format!("room-{i}"),
                    capacity: 2,
                    bed_type: None,
                    bathroom: Bathroom::Shared,
                    base_price: Decimal::from(100),
                    active: true,
                    features: Vec::new(),
                })
                .await
                .unwrap();
        }
        for (url, room) in feeds {
            engine.add_feed(Ulid::new(), rooms[*room], url).await.unwrap();
        }
        (engine, rooms)
    }

    fn synchronizer(bodies: Vec<(&str, Result<String, FeedError>)>, delay: Duration) -> Synchronizer {
        let fetcher = FakeFetcher {
            bodies: bodies
                .into_iter()
                .map(|(url, body)| (url.to_string(), body))
                .collect(),
            delay,
        };
        Synchronizer::new(Arc::new(fetcher), 4, Duration::from_millis(200))
    }

    #[tokio::test]
    async fn failing_feed_does_not_stop_others() {
        let (engine, rooms) = engine_with_rooms(&[
            ("https://airbnb.test/a.ics", 0),
            ("https://vrbo.test/b.ics", 1),
        ])
        .await;
        let sync = synchronizer(
            vec![
                ("https://airbnb.test/a.ics", Ok(feed(&[("20250606", "20250608")]))),
                ("https://vrbo.test/b.ics", Err(FeedError::Status(500))),
            ],
            Duration::ZERO,
        );

        let report = sync.run(&engine, d("2025-06-01")).await.unwrap();
        assert_eq!(report.feeds, 2);
        assert_eq!(report.blocks_inserted, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].room_id, rooms[1]);

        let calendar = engine.room_calendar(&rooms[0]).await.unwrap();
        assert_eq!(calendar.stays.len(), 1);
        assert_eq!(calendar.stays[0].2, BookingStatus::Blocked);
    }

    #[tokio::test]
    async fn rerun_is_idempotent() {
        let (engine, _) = engine_with_rooms(&[("https://airbnb.test/a.ics", 0)]).await;
        let body = feed(&[("20250606", "20250608"), ("20250610", "20250611")]);
        let sync = synchronizer(vec![("https://airbnb.test/a.ics", Ok(body))], Duration::ZERO);

        let first = sync.run(&engine, d("2025-06-01")).await.unwrap();
        assert_eq!(first.blocks_inserted, 2);
        let second = sync.run(&engine, d("2025-06-01")).await.unwrap();
        assert_eq!(second.blocks_inserted, 0);
        assert_eq!(second.already_blocked, 2);
    }

    #[tokio::test]
    async fn past_events_are_skipped_and_old_blocks_purged() {
        let (engine, rooms) = engine_with_rooms(&[("https://airbnb.test/a.ics", 0)]).await;
        let body = feed(&[("20250601", "20250603"), ("20250620", "20250622")]);
        let sync = synchronizer(vec![("https://airbnb.test/a.ics", Ok(body))], Duration::ZERO);

        let report = sync.run(&engine, d("2025-06-01")).await.unwrap();
        assert_eq!(report.blocks_inserted, 2);

        let report = sync.run(&engine, d("2025-06-10")).await.unwrap();
        assert_eq!(report.blocks_purged, 1);
        assert_eq!(report.events_skipped, 1);
        assert_eq!(report.already_blocked, 1);
        let calendar = engine.room_calendar(&rooms[0]).await.unwrap();
        assert_eq!(calendar.stays.len(), 1);
    }

    #[tokio::test]
    async fn slow_feed_times_out() {
        let (engine, _) = engine_with_rooms(&[("https://slow.test/a.ics", 0)]).await;
        let sync = synchronizer(
            vec![("https://slow.test/a.ics", Ok(feed(&[])))],
            Duration::from_secs(5),
        );
        let report = sync.run(&engine, d("2025-06-01")).await.unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].reason, FeedError::Timeout.to_string());
    }

    #[tokio::test]
    async fn garbage_feed_is_a_parse_failure() {
        let (engine, _) = engine_with_rooms(&[("https://airbnb.test/a.ics", 0)]).await;
        let sync = synchronizer(
            vec![("https://airbnb.test/a.ics", Ok("<html>login</html>".into()))],
            Duration::ZERO,
        );
        let report = sync.run(&engine, d("2025-06-01")).await.unwrap();
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].reason.contains("iCalendar"));
    }
}
