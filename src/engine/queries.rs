use chrono::NaiveDate;

use crate::model::*;

use super::availability::day_sheet;
use super::conflict::{find_conflict, occupies_slot};
use super::{Engine, EngineError};

impl Engine {
    /// The day sheet for one court, priced from its schedules.
    pub async fn get_availability(
        &self,
        court_id: CourtId,
        date: NaiveDate,
    ) -> Result<Vec<AvailabilitySlot>, EngineError> {
        let rs = self
            .get_court(&court_id)
            .ok_or(EngineError::NotFound(court_id))?;
        let guard = rs.read().await;
        Ok(day_sheet(&guard, date, self.now()))
    }

    /// Whether `range` on `date` is taken right now. Advisory only: the answer
    /// can change before a later `initiate_booking` takes the court lock.
    pub async fn has_conflict(
        &self,
        court_id: CourtId,
        date: NaiveDate,
        range: TimeRange,
    ) -> Result<bool, EngineError> {
        let rs = self
            .get_court(&court_id)
            .ok_or(EngineError::NotFound(court_id))?;
        let guard = rs.read().await;
        Ok(find_conflict(&guard, date, &range, self.now()).is_some())
    }

    /// Live (unlapsed) holds across every court of a venue on `date`, ordered
    /// by start time.
    pub async fn get_pending_holds(&self, venue_id: VenueId, date: NaiveDate) -> Vec<PendingHold> {
        let now = self.now();
        let handles: Vec<_> = self.courts.iter().map(|e| e.value().clone()).collect();
        let mut holds = Vec::new();
        for rs in handles {
            let guard = rs.read().await;
            if guard.venue_id != venue_id {
                continue;
            }
            holds.extend(
                guard
                    .day(date)
                    .iter()
                    .filter(|b| b.status == BookingStatus::Pending && occupies_slot(b, now))
                    .map(|b| PendingHold {
                        booking_id: b.id,
                        court_id: b.court_id,
                        user_id: b.holder.user_id(),
                        range: b.range,
                        expires_at: b.pending_expires_at.unwrap_or(now),
                    }),
            );
        }
        holds.sort_by_key(|h| (h.range.start, h.court_id));
        holds
    }

    pub async fn get_booking(&self, id: BookingId) -> Result<Booking, EngineError> {
        let court_id = self.court_for_booking(&id).ok_or(EngineError::NotFound(id))?;
        let rs = self.get_court(&court_id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Every booking held by `user`, newest date first. `statuses` narrows the
    /// result when given.
    pub async fn user_bookings(
        &self,
        user: UserId,
        statuses: Option<&[BookingStatus]>,
    ) -> Vec<Booking> {
        let handles: Vec<_> = self.courts.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for rs in handles {
            let guard = rs.read().await;
            out.extend(
                guard
                    .bookings()
                    .filter(|b| b.holder.is_user(user))
                    .filter(|b| statuses.is_none_or(|s| s.contains(&b.status)))
                    .cloned(),
            );
        }
        out.sort_by(|a, b| {
            b.date
                .cmp(&a.date)
                .then(a.range.start.cmp(&b.range.start))
        });
        out
    }

    /// Confirmed bookings on the resale marketplace that have not been played
    /// yet, soonest first.
    pub async fn transfer_listings(&self) -> Vec<Booking> {
        let today = self.local_now().date();
        let handles: Vec<_> = self.courts.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for rs in handles {
            let guard = rs.read().await;
            out.extend(
                guard
                    .days
                    .range(today..)
                    .flat_map(|(_, day)| day.iter())
                    .filter(|b| {
                        b.status == BookingStatus::Confirmed
                            && b.is_for_transfer
                            && b.transfer_status == Some(TransferStatus::Available)
                    })
                    .cloned(),
            );
        }
        out.sort_by_key(|b| (b.date, b.range.start));
        out
    }
}
