use chrono::NaiveDateTime;

use crate::model::*;
use crate::notify::NoticeAction;
use crate::observability::*;

use super::conflict::is_lapsed;
use super::{Engine, EngineError, SharedCourtState};

/// Bookings whose slot has fully elapsed in venue time and which are still
/// pending or confirmed.
fn past_bookings(cs: &CourtState, local_now: NaiveDateTime) -> Vec<BookingId> {
    let today = local_now.date();
    let time = local_now.time();
    cs.days
        .range(..=today)
        .flat_map(|(date, day)| day.iter().map(move |b| (*date, b)))
        .filter(|(date, b)| *date < today || b.range.end <= time)
        .filter(|(_, b)| matches!(b.status, BookingStatus::Pending | BookingStatus::Confirmed))
        .map(|(_, b)| b.id)
        .collect()
}

impl Engine {
    /// Cancel every lapsed hold on one court. Caller holds the write lock.
    ///
    /// Each expiry is its own event, so a crash midway leaves the rest for the
    /// next pass.
    pub(super) async fn expire_lapsed_on(&self, cs: &mut CourtState, now: Ms) -> Result<usize, EngineError> {
        let mut lapsed: Vec<BookingId> = cs
            .pending_holds()
            .filter(|b| is_lapsed(b, now))
            .map(|b| b.id)
            .collect();
        lapsed.sort();

        for id in &lapsed {
            let event = Event::HoldExpired {
                id: *id,
                court_id: cs.id,
            };
            self.persist_and_apply(cs, &event).await?;
            if let Some(snapshot) = cs.booking(id) {
                self.publish(snapshot, NoticeAction::Expired);
            }
        }
        if !lapsed.is_empty() {
            metrics::counter!(HOLDS_EXPIRED_TOTAL).increment(lapsed.len() as u64);
        }
        Ok(lapsed.len())
    }

    fn court_handles(&self) -> Vec<SharedCourtState> {
        self.courts.iter().map(|e| e.value().clone()).collect()
    }

    /// Cancel every pending hold whose expiry has passed. Safe to run at any
    /// time and any number of times; a hold confirmed or cancelled in the
    /// meantime is skipped because the predicate is rechecked under the lock.
    pub async fn sweep_lapsed_holds(&self) -> Result<usize, EngineError> {
        let now = self.now();
        let mut total = 0;
        for rs in self.court_handles() {
            {
                let guard = rs.read().await;
                if guard.retired || !guard.pending_holds().any(|b| is_lapsed(b, now)) {
                    continue;
                }
            }
            let mut guard = rs.write().await;
            if guard.retired {
                continue;
            }
            total += self.expire_lapsed_on(&mut guard, now).await?;
        }
        if total > 0 {
            tracing::info!("lapse sweep cancelled {total} holds");
        }
        Ok(total)
    }

    /// Mark every pending or confirmed booking whose end time has passed as
    /// completed. No notices are sent.
    pub async fn complete_past_bookings(&self) -> Result<usize, EngineError> {
        let local_now = self.local_now();
        let mut total = 0;
        for rs in self.court_handles() {
            {
                let guard = rs.read().await;
                if guard.retired || past_bookings(&guard, local_now).is_empty() {
                    continue;
                }
            }
            let mut guard = rs.write().await;
            if guard.retired {
                continue;
            }
            let ids = past_bookings(&guard, local_now);
            if ids.is_empty() {
                continue;
            }
            let count = ids.len();
            let event = Event::BookingsCompleted {
                court_id: guard.id,
                ids,
            };
            self.persist_and_apply(&mut guard, &event).await?;
            total += count;
        }
        if total > 0 {
            metrics::counter!(BOOKINGS_COMPLETED_TOTAL).increment(total as u64);
            tracing::info!("completion sweep closed {total} bookings");
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};
    use ulid::Ulid;

    fn booking(date: NaiveDate, start: u32, end: u32, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            court_id: Ulid::nil(),
            venue_id: Ulid::nil(),
            date,
            range: TimeRange::new(
                NaiveTime::from_hms_opt(start, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(end, 0, 0).unwrap(),
            )
            .unwrap(),
            holder: Holder::RegisteredUser(Ulid::new()),
            status,
            is_paid: false,
            payment_code: None,
            pending_expires_at: None,
            total_price: 0,
            is_for_transfer: false,
            transfer_status: None,
            transfer_price: None,
            created_at: 0,
        }
    }

    #[test]
    fn past_bookings_cut_at_end_time() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let yesterday = today.pred_opt().unwrap();
        let mut cs = CourtState::new(Ulid::nil(), Ulid::nil(), "A".into());

        let old = booking(yesterday, 20, 21, BookingStatus::Confirmed);
        let ended = booking(today, 8, 9, BookingStatus::Confirmed);
        let running = booking(today, 9, 11, BookingStatus::Confirmed);
        let cancelled = booking(today, 7, 8, BookingStatus::Cancelled);
        let tomorrow = booking(today.succ_opt().unwrap(), 8, 9, BookingStatus::Pending);
        let expect = [old.id, ended.id];
        for b in [old, ended, running, cancelled, tomorrow] {
            cs.insert_booking(b);
        }

        let now = today.and_hms_opt(10, 0, 0).unwrap();
        let mut got = past_bookings(&cs, now);
        got.sort();
        let mut expect = expect.to_vec();
        expect.sort();
        assert_eq!(got, expect);
    }
}
