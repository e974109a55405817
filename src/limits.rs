//! Hard caps that keep a single process from being exhausted by one client.

use crate::model::Ms;

pub const MAX_COURTS: usize = 10_000;
pub const MAX_SCHEDULES_PER_COURT: usize = 512;
pub const MAX_BOOKINGS_PER_COURT_DAY: usize = 1_000;
pub const MAX_NAME_LEN: usize = 255;
pub const MAX_GUEST_PHONE_LEN: usize = 50;

/// Longest hold a configuration may ask for.
pub const MAX_HOLD_TTL_MS: Ms = 24 * 3_600_000;

pub const PAYMENT_CODE_RANDOM_LEN: usize = 8;
