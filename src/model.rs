use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{Datelike, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for expiry and audit fields.
pub type Ms = i64;

/// Integer currency units (no minor units).
pub type Price = i64;

pub type UserId = Ulid;
pub type VenueId = Ulid;
pub type CourtId = Ulid;
pub type BookingId = Ulid;

/// Half-open time-of-day range `[start, end)`. Never crosses midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeRange {
    /// Returns `None` unless `start < end`.
    pub fn new(start: NaiveTime, end: NaiveTime) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains(&self, other: &TimeRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }
}

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

/// Who a booking is for. Exactly one variant is ever populated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Holder {
    RegisteredUser(UserId),
    Guest { name: String, phone: Option<String> },
}

impl Holder {
    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Holder::RegisteredUser(id) => Some(*id),
            Holder::Guest { .. } => None,
        }
    }

    pub fn is_user(&self, actor: UserId) -> bool {
        self.user_id() == Some(actor)
    }

    pub fn label(&self) -> String {
        match self {
            Holder::RegisteredUser(id) => id.to_string(),
            Holder::Guest { name, .. } => name.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(BookingStatus::Pending),
            "confirmed" => Some(BookingStatus::Confirmed),
            "completed" => Some(BookingStatus::Completed),
            "cancelled" => Some(BookingStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Available,
    Transferred,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Available => "available",
            TransferStatus::Transferred => "transferred",
        }
    }
}

/// The central entity. Mutated only through engine events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub court_id: CourtId,
    pub venue_id: VenueId,
    pub date: NaiveDate,
    pub range: TimeRange,
    pub holder: Holder,
    pub status: BookingStatus,
    pub is_paid: bool,
    pub payment_code: Option<String>,
    /// Set only while `status == Pending`.
    pub pending_expires_at: Option<Ms>,
    pub total_price: Price,
    pub is_for_transfer: bool,
    pub transfer_status: Option<TransferStatus>,
    pub transfer_price: Option<Price>,
    pub created_at: Ms,
}

/// A pricing rule for one court on one day of the week.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingSchedule {
    pub id: Ulid,
    pub court_id: CourtId,
    /// 0 = Sunday … 6 = Saturday.
    pub day_of_week: u8,
    pub range: TimeRange,
    pub price: Price,
    pub effective_from: NaiveDate,
    /// `None` means open-ended.
    pub effective_to: Option<NaiveDate>,
    pub active: bool,
}

impl PricingSchedule {
    /// Active, matching weekday, and inside the effective date window.
    pub fn applies_on(&self, date: NaiveDate) -> bool {
        self.active
            && self.day_of_week == day_of_week(date)
            && self.effective_from <= date
            && self.effective_to.is_none_or(|to| to >= date)
    }

    /// Effective date windows intersect (open ends are unbounded).
    pub fn effective_overlaps(&self, other: &PricingSchedule) -> bool {
        let self_before_other_ends = other.effective_to.is_none_or(|to| self.effective_from <= to);
        let other_before_self_ends = self.effective_to.is_none_or(|to| other.effective_from <= to);
        self_before_other_ends && other_before_self_ends
    }
}

pub fn day_of_week(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

/// Live state of one court: registry data, pricing, and every booking it has
/// ever carried, bucketed by date and sorted by start time.
#[derive(Debug, Clone)]
pub struct CourtState {
    pub id: CourtId,
    pub venue_id: VenueId,
    pub name: String,
    pub active: bool,
    pub schedules: Vec<PricingSchedule>,
    pub days: BTreeMap<NaiveDate, Vec<Booking>>,
    /// booking id → date bucket
    locator: HashMap<BookingId, NaiveDate>,
    /// Ids of bookings still in `Pending`.
    pending: HashSet<BookingId>,
    /// Set once the court is deleted; holders of a stale handle must re-resolve.
    pub retired: bool,
}

impl CourtState {
    pub fn new(id: CourtId, venue_id: VenueId, name: String) -> Self {
        Self {
            id,
            venue_id,
            name,
            active: true,
            schedules: Vec::new(),
            days: BTreeMap::new(),
            locator: HashMap::new(),
            pending: HashSet::new(),
            retired: false,
        }
    }

    /// Insert booking maintaining sort order by start time within its day.
    pub fn insert_booking(&mut self, booking: Booking) {
        let day = self.days.entry(booking.date).or_default();
        let pos = day
            .binary_search_by_key(&booking.range.start, |b| b.range.start)
            .unwrap_or_else(|e| e);
        self.locator.insert(booking.id, booking.date);
        if booking.status == BookingStatus::Pending {
            self.pending.insert(booking.id);
        }
        day.insert(pos, booking);
    }

    /// Move a booking to `status`. Leaving `Pending` drops it from the hold index.
    pub fn set_status(&mut self, id: &BookingId, status: BookingStatus) -> Option<&mut Booking> {
        if status != BookingStatus::Pending {
            self.pending.remove(id);
        }
        let booking = self.booking_mut(id)?;
        booking.status = status;
        Some(booking)
    }

    /// Bookings still pending, on any date. Cost follows the number of open
    /// holds, not the court's history.
    pub fn pending_holds(&self) -> impl Iterator<Item = &Booking> {
        self.pending.iter().filter_map(|id| self.booking(id))
    }

    pub fn booking(&self, id: &BookingId) -> Option<&Booking> {
        let date = self.locator.get(id)?;
        self.days.get(date)?.iter().find(|b| b.id == *id)
    }

    pub fn booking_mut(&mut self, id: &BookingId) -> Option<&mut Booking> {
        let date = self.locator.get(id)?;
        self.days.get_mut(date)?.iter_mut().find(|b| b.id == *id)
    }

    pub fn day(&self, date: NaiveDate) -> &[Booking] {
        self.days.get(&date).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Bookings on `date` whose range overlaps `range`, regardless of status.
    /// Uses binary search to skip bookings starting at or after `range.end`.
    pub fn overlapping(&self, date: NaiveDate, range: &TimeRange) -> impl Iterator<Item = &Booking> {
        let day = self.day(date);
        let right_bound = day.partition_point(|b| b.range.start < range.end);
        day[..right_bound]
            .iter()
            .filter(move |b| b.range.end > range.start)
    }

    pub fn bookings(&self) -> impl Iterator<Item = &Booking> {
        self.days.values().flatten()
    }

    pub fn booking_count(&self) -> usize {
        self.locator.len()
    }
}

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CourtCreated {
        id: CourtId,
        venue_id: VenueId,
        name: String,
    },
    CourtUpdated {
        id: CourtId,
        name: String,
        active: bool,
    },
    CourtDeleted {
        id: CourtId,
    },
    ScheduleAdded {
        schedule: PricingSchedule,
    },
    ScheduleRemoved {
        id: Ulid,
        court_id: CourtId,
    },
    /// A new pending hold or walk-in booking, or a compaction snapshot.
    BookingPlaced {
        booking: Booking,
    },
    BookingConfirmed {
        id: BookingId,
        court_id: CourtId,
    },
    BookingCancelled {
        id: BookingId,
        court_id: CourtId,
    },
    HoldExpired {
        id: BookingId,
        court_id: CourtId,
    },
    BookingsCompleted {
        court_id: CourtId,
        ids: Vec<BookingId>,
    },
    TransferListed {
        id: BookingId,
        court_id: CourtId,
        price: Option<Price>,
    },
    TransferPurchased {
        id: BookingId,
        court_id: CourtId,
        buyer: UserId,
    },
}

impl Event {
    /// The court an event mutates.
    pub fn court_id(&self) -> CourtId {
        match self {
            Event::CourtCreated { id, .. }
            | Event::CourtUpdated { id, .. }
            | Event::CourtDeleted { id } => *id,
            Event::ScheduleAdded { schedule } => schedule.court_id,
            Event::BookingPlaced { booking } => booking.court_id,
            Event::ScheduleRemoved { court_id, .. }
            | Event::BookingConfirmed { court_id, .. }
            | Event::BookingCancelled { court_id, .. }
            | Event::HoldExpired { court_id, .. }
            | Event::BookingsCompleted { court_id, .. }
            | Event::TransferListed { court_id, .. }
            | Event::TransferPurchased { court_id, .. } => *court_id,
        }
    }
}

// ── Request / result types ───────────────────────────────────────

/// Input to `initiate_booking` and `create_walk_in`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: BookingId,
    pub court_id: CourtId,
    pub date: NaiveDate,
    pub range: TimeRange,
    pub holder: Holder,
    pub price_override: Option<Price>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldReceipt {
    pub booking_id: BookingId,
    pub payment_code: String,
    pub expires_at: Ms,
    pub total_price: Price,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Free,
    Booked,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Free => "free",
            SlotStatus::Booked => "booked",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingSummary {
    pub id: BookingId,
    pub status: BookingStatus,
    pub holder: String,
    pub pending_expires_at: Option<Ms>,
}

/// One row of a court's day sheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilitySlot {
    pub range: TimeRange,
    /// Schedule price for the segment; `None` when no schedule covers it.
    pub price: Option<Price>,
    pub status: SlotStatus,
    pub booking: Option<BookingSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingHold {
    pub booking_id: BookingId,
    pub court_id: CourtId,
    pub user_id: Option<UserId>,
    pub range: TimeRange,
    pub expires_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourtInfo {
    pub id: CourtId,
    pub venue_id: VenueId,
    pub name: String,
    pub active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn schedule(from: &str, to: Option<&str>) -> PricingSchedule {
        PricingSchedule {
            id: Ulid::new(),
            court_id: Ulid::new(),
            day_of_week: 0,
            range: TimeRange::new(t(18, 0), t(19, 0)).unwrap(),
            price: 100_000,
            effective_from: d(from),
            effective_to: to.map(d),
            active: true,
        }
    }

    #[test]
    fn range_rejects_empty_and_inverted() {
        assert!(TimeRange::new(t(10, 0), t(10, 0)).is_none());
        assert!(TimeRange::new(t(11, 0), t(10, 0)).is_none());
        assert_eq!(TimeRange::new(t(10, 0), t(11, 30)).unwrap().minutes(), 90);
    }

    #[test]
    fn range_overlap_is_half_open() {
        let a = TimeRange::new(t(18, 0), t(19, 0)).unwrap();
        let b = TimeRange::new(t(18, 30), t(19, 30)).unwrap();
        let c = TimeRange::new(t(19, 0), t(20, 0)).unwrap();
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn range_contains() {
        let outer = TimeRange::new(t(6, 0), t(22, 0)).unwrap();
        let inner = TimeRange::new(t(18, 0), t(19, 0)).unwrap();
        let partial = TimeRange::new(t(21, 0), t(23, 0)).unwrap();
        assert!(outer.contains(&inner));
        assert!(outer.contains(&outer));
        assert!(!outer.contains(&partial));
    }

    #[test]
    fn day_of_week_starts_on_sunday() {
        assert_eq!(day_of_week(d("2026-03-01")), 0);
        assert_eq!(day_of_week(d("2026-03-02")), 1);
        assert_eq!(day_of_week(d("2026-03-07")), 6);
    }

    #[test]
    fn schedule_effective_window() {
        let s = schedule("2026-03-01", Some("2026-03-08"));
        assert!(s.applies_on(d("2026-03-01")));
        assert!(s.applies_on(d("2026-03-08")));
        assert!(!s.applies_on(d("2026-03-15")));
        assert!(!s.applies_on(d("2026-03-02"))); // Monday

        let open = schedule("2026-03-01", None);
        assert!(open.applies_on(d("2030-01-06")));

        let mut inactive = schedule("2026-03-01", None);
        inactive.active = false;
        assert!(!inactive.applies_on(d("2026-03-01")));
    }

    #[test]
    fn schedule_effective_overlap() {
        let a = schedule("2026-01-01", Some("2026-01-31"));
        let b = schedule("2026-02-01", None);
        let c = schedule("2026-01-15", Some("2026-02-15"));
        assert!(!a.effective_overlaps(&b));
        assert!(a.effective_overlaps(&c));
        assert!(b.effective_overlaps(&c));
        assert!(b.effective_overlaps(&schedule("2027-01-01", None)));
    }

    #[test]
    fn holder_ownership() {
        let user = Ulid::new();
        assert!(Holder::RegisteredUser(user).is_user(user));
        assert!(!Holder::RegisteredUser(user).is_user(Ulid::new()));
        let guest = Holder::Guest { name: "Lan".into(), phone: None };
        assert!(!guest.is_user(user));
        assert_eq!(guest.label(), "Lan");
    }
}
