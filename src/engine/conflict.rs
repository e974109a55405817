use chrono::NaiveDate;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// A pending hold whose expiry is at or before `now`. The single lapse
/// predicate shared by the conflict check, the confirm path and the sweeper.
pub fn is_lapsed(booking: &Booking, now: Ms) -> bool {
    booking.status == BookingStatus::Pending
        && booking.pending_expires_at.is_none_or(|expires_at| expires_at <= now)
}

/// Whether a booking occupies its slot at `now`.
pub(crate) fn occupies_slot(booking: &Booking, now: Ms) -> bool {
    match booking.status {
        BookingStatus::Confirmed | BookingStatus::Completed => true,
        BookingStatus::Pending => !is_lapsed(booking, now),
        BookingStatus::Cancelled => false,
    }
}

/// First booking on `date` that occupies any part of `range`.
pub fn find_conflict<'a>(
    cs: &'a CourtState,
    date: NaiveDate,
    range: &TimeRange,
    now: Ms,
) -> Option<&'a Booking> {
    cs.overlapping(date, range)
        .find(|b| occupies_slot(b, now))
}

pub(crate) fn check_no_conflict(
    cs: &CourtState,
    date: NaiveDate,
    range: &TimeRange,
    now: Ms,
) -> Result<(), EngineError> {
    match find_conflict(cs, date, range, now) {
        Some(existing) => Err(EngineError::SlotConflict {
            court_id: cs.id,
            date,
            range: *range,
            conflicting: existing.id,
        }),
        None => Ok(()),
    }
}

/// Rejects slots dated before the venue's current day.
pub(crate) fn validate_slot(date: NaiveDate, today: NaiveDate) -> Result<(), EngineError> {
    if date < today {
        return Err(EngineError::InvalidSlot("date is in the past"));
    }
    Ok(())
}

impl Holder {
    /// Build a holder from the loose optional fields a request carries.
    /// Exactly one of `user_id` and `guest_name` must be present.
    pub fn from_parts(
        user_id: Option<UserId>,
        guest_name: Option<String>,
        guest_phone: Option<String>,
    ) -> Result<Holder, EngineError> {
        let guest_name = guest_name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());
        match (user_id, guest_name) {
            (Some(id), None) => Ok(Holder::RegisteredUser(id)),
            (None, Some(name)) => {
                if name.len() > MAX_NAME_LEN {
                    return Err(EngineError::InvalidHolder("guest name too long"));
                }
                let phone = guest_phone
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty());
                if phone.as_ref().is_some_and(|p| p.len() > MAX_GUEST_PHONE_LEN) {
                    return Err(EngineError::InvalidHolder("guest phone too long"));
                }
                Ok(Holder::Guest { name, phone })
            }
            (Some(_), Some(_)) => Err(EngineError::InvalidHolder(
                "both a registered user and a guest were supplied",
            )),
            (None, None) => Err(EngineError::InvalidHolder(
                "either a registered user or a guest name is required",
            )),
        }
    }
}
