use chrono::NaiveDate;
use thiserror::Error;
use ulid::Ulid;

use crate::model::{Ms, TimeRange};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),

    #[error("already exists: {0}")]
    AlreadyExists(Ulid),

    #[error("slot {range} on {date} for court {court_id} is taken by booking {conflicting}")]
    SlotConflict {
        court_id: Ulid,
        date: NaiveDate,
        range: TimeRange,
        conflicting: Ulid,
    },

    #[error("hold {id} expired at {expired_at}; start a new booking")]
    HoldExpired { id: Ulid, expired_at: Ms },

    #[error("invalid holder: {0}")]
    InvalidHolder(&'static str),

    #[error("invalid slot: {0}")]
    InvalidSlot(&'static str),

    #[error("no pricing configured for {range} on {date} for court {court_id}")]
    NoPricing {
        court_id: Ulid,
        date: NaiveDate,
        range: TimeRange,
    },

    #[error("court {0} is not accepting bookings")]
    CourtInactive(Ulid),

    #[error("schedule overlaps existing schedule {0}")]
    ScheduleOverlap(Ulid),

    #[error("cannot delete court {0}: it still has bookings")]
    HasBookings(Ulid),

    #[error("transfer not allowed: {0}")]
    TransferNotAllowed(&'static str),

    /// A court handle went stale between lookup and lock. Retried internally.
    #[error("concurrent change on court {0}")]
    StorageConflict(Ulid),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// Expected, user-facing outcomes as opposed to operator-facing failures.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, EngineError::WalError(_) | EngineError::StorageConflict(_))
    }
}
