use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::sql::Command;

// ── Wire (request-driven) ───────────────────────────────────────

/// Counter: statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "courtside_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "courtside_query_duration_seconds";

/// Gauge: open client connections.
pub const CONNECTIONS_ACTIVE: &str = "courtside_connections_active";

pub const CONNECTIONS_TOTAL: &str = "courtside_connections_total";

/// Counter: connections turned away at the connection limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "courtside_connections_rejected_total";

// ── Reservation lifecycle ───────────────────────────────────────

pub const HOLDS_PLACED_TOTAL: &str = "courtside_holds_placed_total";
pub const WALK_INS_TOTAL: &str = "courtside_walk_ins_total";
pub const BOOKINGS_CONFIRMED_TOTAL: &str = "courtside_bookings_confirmed_total";
pub const BOOKINGS_CANCELLED_TOTAL: &str = "courtside_bookings_cancelled_total";

/// Counter: holds cancelled because they lapsed, by the sweeper or on confirm.
pub const HOLDS_EXPIRED_TOTAL: &str = "courtside_holds_expired_total";

pub const BOOKINGS_COMPLETED_TOTAL: &str = "courtside_bookings_completed_total";

/// Counter: initiate/walk-in requests refused because the slot was taken.
pub const SLOT_CONFLICTS_TOTAL: &str = "courtside_slot_conflicts_total";

pub const TRANSFERS_TOTAL: &str = "courtside_transfers_total";

/// Counter: background sweep or compaction passes that failed. Labels: task.
pub const BACKGROUND_FAILURES_TOTAL: &str = "courtside_background_failures_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "courtside_wal_flush_duration_seconds";

/// Histogram: events per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "courtside_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. Does nothing without a port.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://{addr}/metrics");
    Ok(())
}

/// Short metrics label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertCourt { .. } => "insert_court",
        Command::DeleteCourt { .. } => "delete_court",
        Command::InsertSchedule(_) => "insert_schedule",
        Command::DeleteSchedule { .. } => "delete_schedule",
        Command::InsertHold(_) => "initiate_booking",
        Command::InsertWalkIn(_) => "walk_in",
        Command::ConfirmBooking { .. } => "confirm_booking",
        Command::CancelHold { .. } => "cancel_booking",
        Command::ListTransfer { .. } => "mark_for_transfer",
        Command::PurchaseTransfer { .. } => "purchase_transfer",
        Command::SelectCourts { .. } => "select_courts",
        Command::SelectSchedules { .. } => "select_schedules",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectPendingHolds { .. } => "select_pending_holds",
        Command::SelectBooking { .. } => "select_booking",
        Command::SelectUserBookings { .. } => "select_user_bookings",
        Command::SelectTransferListings => "select_transfer_listings",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
