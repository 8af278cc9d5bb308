use std::net::SocketAddr;

use crate::sql::Command;

// ── Requests ────────────────────────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "innkeep_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "innkeep_query_duration_seconds";

// ── Connections ─────────────────────────────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "innkeep_connections_active";
pub const CONNECTIONS_TOTAL: &str = "innkeep_connections_total";
pub const CONNECTIONS_REJECTED_TOTAL: &str = "innkeep_connections_rejected_total";
pub const AUTH_FAILURES_TOTAL: &str = "innkeep_auth_failures_total";

// ── Journal ─────────────────────────────────────────────────────

/// Histogram: group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_SECONDS: &str = "innkeep_journal_flush_seconds";

/// Histogram: events per group commit.
pub const JOURNAL_BATCH_SIZE: &str = "innkeep_journal_batch_size";

// ── Bookings ────────────────────────────────────────────────────

/// Counter. Labels: source.
pub const BOOKINGS_CREATED: &str = "innkeep_bookings_created_total";
pub const BOOKING_CONFLICTS: &str = "innkeep_booking_conflicts_total";
pub const DUPLICATE_DELIVERIES: &str = "innkeep_duplicate_deliveries_total";

/// Counter: payment callbacks. Labels: outcome.
pub const PAYMENT_EVENTS: &str = "innkeep_payment_events_total";

// ── Calendar sync ───────────────────────────────────────────────

pub const BLOCKS_INSERTED: &str = "innkeep_blocks_inserted_total";
pub const BLOCKS_PURGED: &str = "innkeep_blocks_purged_total";
/// Counter: external holds that landed on top of a booking made here.
pub const DOUBLE_BOOKINGS_DETECTED: &str = "innkeep_double_bookings_detected_total";
/// Counter. Labels: reason.
pub const FEED_FAILURES: &str = "innkeep_feed_failures_total";
pub const SYNC_DURATION_SECONDS: &str = "innkeep_sync_duration_seconds";

/// Install the Prometheus exporter on `port`. No-op if `port` is `None`.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short `verb_table` label for a command.
pub fn command_label(cmd: &Command) -> String {
    let verb = match cmd {
        Command::Insert { .. } => "insert",
        Command::Update { .. } => "update",
        Command::Delete { .. } => "delete",
        Command::Select { .. } => "select",
    };
    format!("{verb}_{}", cmd.table().name())
}
