use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

/// Price of `range` on `date` from the schedules in effect that day.
///
/// A schedule is eligible when it applies on `date` and its range fully
/// contains `range`. Schedules are kept sorted by start time, so the earliest
/// eligible one wins if the data ever holds more than one.
pub fn resolve_price(schedules: &[PricingSchedule], date: NaiveDate, range: &TimeRange) -> Option<Price> {
    let mut eligible = schedules
        .iter()
        .filter(|s| s.applies_on(date) && s.range.contains(range));
    let first = eligible.next()?;
    if let Some(other) = eligible.next() {
        tracing::warn!(
            "schedules {} and {} both price {range} on {date}; using {}",
            first.id,
            other.id,
            first.id
        );
    }
    Some(first.price)
}

/// Schedules in effect on `date`, sorted by start time.
pub(crate) fn effective_schedules(schedules: &[PricingSchedule], date: NaiveDate) -> Vec<&PricingSchedule> {
    let mut v: Vec<_> = schedules.iter().filter(|s| s.applies_on(date)).collect();
    v.sort_by_key(|s| s.range.start);
    v
}

/// The creation-time guard: no two active schedules for the same court and
/// weekday may overlap in both time of day and effective dates.
pub(crate) fn check_schedule_overlap(
    existing: &[PricingSchedule],
    candidate: &PricingSchedule,
) -> Result<(), EngineError> {
    if !candidate.active {
        return Ok(());
    }
    if let Some(clash) = existing.iter().find(|s| {
        s.id != candidate.id
            && s.active
            && s.day_of_week == candidate.day_of_week
            && s.range.overlaps(&candidate.range)
            && s.effective_overlaps(candidate)
    }) {
        return Err(EngineError::ScheduleOverlap(clash.id));
    }
    Ok(())
}

pub(crate) fn validate_schedule(schedule: &PricingSchedule) -> Result<(), EngineError> {
    if schedule.day_of_week > 6 {
        return Err(EngineError::InvalidSlot("day_of_week must be 0-6"));
    }
    if schedule.price < 0 {
        return Err(EngineError::InvalidSlot("price must not be negative"));
    }
    if schedule
        .effective_to
        .is_some_and(|to| to < schedule.effective_from)
    {
        return Err(EngineError::InvalidSlot("effective_to before effective_from"));
    }
    Ok(())
}

impl Engine {
    /// Pricing Calendar lookup for a court.
    pub async fn price_for(
        &self,
        court_id: Ulid,
        date: NaiveDate,
        range: TimeRange,
    ) -> Result<Price, EngineError> {
        let rs = self
            .get_court(&court_id)
            .ok_or(EngineError::NotFound(court_id))?;
        let guard = rs.read().await;
        resolve_price(&guard.schedules, date, &range).ok_or(EngineError::NoPricing {
            court_id,
            date,
            range,
        })
    }

    pub async fn add_schedule(&self, schedule: PricingSchedule) -> Result<(), EngineError> {
        validate_schedule(&schedule)?;
        let mut guard = self.lock_court(&schedule.court_id).await?;
        if guard.schedules.len() >= MAX_SCHEDULES_PER_COURT {
            return Err(EngineError::LimitExceeded("too many schedules on court"));
        }
        if guard.schedules.iter().any(|s| s.id == schedule.id) {
            return Err(EngineError::AlreadyExists(schedule.id));
        }
        check_schedule_overlap(&guard.schedules, &schedule)?;

        let event = Event::ScheduleAdded { schedule };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn remove_schedule(&self, id: Ulid) -> Result<(), EngineError> {
        let handles: Vec<_> = self.courts.iter().map(|e| e.value().clone()).collect();
        let mut owner = None;
        for rs in handles {
            let guard = rs.read().await;
            if guard.schedules.iter().any(|s| s.id == id) {
                owner = Some(guard.id);
                break;
            }
        }
        let court_id = owner.ok_or(EngineError::NotFound(id))?;

        let mut guard = self.lock_court(&court_id).await?;
        if !guard.schedules.iter().any(|s| s.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::ScheduleRemoved { id, court_id };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn schedules(&self, court_id: Ulid) -> Result<Vec<PricingSchedule>, EngineError> {
        let rs = self
            .get_court(&court_id)
            .ok_or(EngineError::NotFound(court_id))?;
        let guard = rs.read().await;
        Ok(guard.schedules.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn t(h: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, 0, 0).unwrap()
    }

    fn r(a: u32, b: u32) -> TimeRange {
        TimeRange::new(t(a), t(b)).unwrap()
    }

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn sched(dow: u8, range: TimeRange, price: Price, from: &str, to: Option<&str>) -> PricingSchedule {
        PricingSchedule {
            id: Ulid::new(),
            court_id: Ulid::new(),
            day_of_week: dow,
            range,
            price,
            effective_from: d(from),
            effective_to: to.map(d),
            active: true,
        }
    }

    #[test]
    fn price_from_containing_schedule() {
        let schedules = vec![
            sched(0, r(6, 17), 80_000, "2026-01-01", None),
            sched(0, r(17, 22), 100_000, "2026-01-01", None),
        ];
        assert_eq!(resolve_price(&schedules, d("2026-03-01"), &r(18, 19)), Some(100_000));
        assert_eq!(resolve_price(&schedules, d("2026-03-01"), &r(8, 10)), Some(80_000));
    }

    #[test]
    fn straddling_two_schedules_is_not_priced() {
        let schedules = vec![
            sched(0, r(6, 17), 80_000, "2026-01-01", None),
            sched(0, r(17, 22), 100_000, "2026-01-01", None),
        ];
        assert_eq!(resolve_price(&schedules, d("2026-03-01"), &r(16, 18)), None);
    }

    #[test]
    fn wrong_weekday_or_window_is_not_priced() {
        let schedules = vec![sched(0, r(17, 22), 100_000, "2026-03-01", Some("2026-03-31"))];
        assert_eq!(resolve_price(&schedules, d("2026-03-02"), &r(18, 19)), None);
        assert_eq!(resolve_price(&schedules, d("2026-02-22"), &r(18, 19)), None);
        assert_eq!(resolve_price(&schedules, d("2026-04-05"), &r(18, 19)), None);
        assert_eq!(resolve_price(&schedules, d("2026-03-29"), &r(18, 19)), Some(100_000));
    }

    #[test]
    fn inactive_schedule_is_ignored() {
        let mut s = sched(0, r(17, 22), 100_000, "2026-01-01", None);
        s.active = false;
        assert_eq!(resolve_price(&[s], d("2026-03-01"), &r(18, 19)), None);
    }

    #[test]
    fn overlap_guard() {
        let existing = vec![sched(0, r(17, 22), 100_000, "2026-01-01", Some("2026-06-30"))];

        // Same day, overlapping time, overlapping dates
        let clash = sched(0, r(21, 23), 90_000, "2026-06-01", None);
        assert!(matches!(
            check_schedule_overlap(&existing, &clash),
            Err(EngineError::ScheduleOverlap(_))
        ));

        // Next price period starts after the old one ends
        let next = sched(0, r(17, 22), 120_000, "2026-07-01", None);
        assert!(check_schedule_overlap(&existing, &next).is_ok());

        // Adjacent time range
        let adjacent = sched(0, r(22, 23), 60_000, "2026-01-01", None);
        assert!(check_schedule_overlap(&existing, &adjacent).is_ok());

        // Other weekday
        let monday = sched(1, r(17, 22), 100_000, "2026-01-01", None);
        assert!(check_schedule_overlap(&existing, &monday).is_ok());

        // Inactive candidates are not guarded
        let mut inactive = clash.clone();
        inactive.active = false;
        assert!(check_schedule_overlap(&existing, &inactive).is_ok());
    }

    #[test]
    fn schedule_validation() {
        let mut s = sched(7, r(17, 22), 100_000, "2026-01-01", None);
        assert!(validate_schedule(&s).is_err());
        s.day_of_week = 6;
        assert!(validate_schedule(&s).is_ok());
        s.effective_to = Some(d("2025-12-31"));
        assert!(validate_schedule(&s).is_err());
    }
}
