use chrono::NaiveDate;

use crate::model::*;

use super::conflict::occupies_slot;
use super::pricing::effective_schedules;

// ── Day sheet ─────────────────────────────────────────────────────

/// Build the slot sheet for one court on one date.
///
/// Schedule windows are split around the bookings that occupy them: gaps come
/// back `free` with the window's price, occupied stretches come back `booked`
/// with a summary of the booking. Bookings that fall outside every schedule
/// (walk-ins at a custom price) are still listed, priced `None`.
pub fn day_sheet(cs: &CourtState, date: NaiveDate, now: Ms) -> Vec<AvailabilitySlot> {
    let windows: Vec<(TimeRange, Price)> = effective_schedules(&cs.schedules, date)
        .into_iter()
        .map(|s| (s.range, s.price))
        .collect();

    // Already sorted by start; occupying bookings never overlap each other.
    let occupied: Vec<&Booking> = cs
        .day(date)
        .iter()
        .filter(|b| occupies_slot(b, now))
        .collect();
    let occupied_ranges: Vec<TimeRange> = occupied.iter().map(|b| b.range).collect();

    let mut sheet = Vec::with_capacity(windows.len() + occupied.len());
    for (window, price) in &windows {
        for gap in subtract_ranges(window, &occupied_ranges) {
            sheet.push(AvailabilitySlot {
                range: gap,
                price: Some(*price),
                status: SlotStatus::Free,
                booking: None,
            });
        }
    }
    for b in occupied {
        let price = windows
            .iter()
            .find(|(w, _)| w.contains(&b.range))
            .map(|(_, p)| *p);
        sheet.push(AvailabilitySlot {
            range: b.range,
            price,
            status: SlotStatus::Booked,
            booking: Some(BookingSummary {
                id: b.id,
                status: b.status,
                holder: b.holder.label(),
                pending_expires_at: b.pending_expires_at,
            }),
        });
    }

    sheet.sort_by_key(|s| (s.range.start, s.range.end));
    sheet
}

/// Parts of `base` not covered by any of `sorted` (sorted by start).
pub(crate) fn subtract_ranges(base: &TimeRange, sorted: &[TimeRange]) -> Vec<TimeRange> {
    let mut result = Vec::new();
    let mut cursor = base.start;
    for r in sorted {
        if r.end <= cursor {
            continue;
        }
        if r.start >= base.end {
            break;
        }
        if let Some(gap) = TimeRange::new(cursor, r.start) {
            result.push(gap);
        }
        cursor = cursor.max(r.end);
    }
    if let Some(tail) = TimeRange::new(cursor, base.end) {
        result.push(tail);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;
    use ulid::Ulid;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn r(a: (u32, u32), b: (u32, u32)) -> TimeRange {
        TimeRange::new(t(a.0, a.1), t(b.0, b.1)).unwrap()
    }

    fn sunday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()
    }

    fn court() -> CourtState {
        let mut cs = CourtState::new(Ulid::new(), Ulid::new(), "Court 7".into());
        cs.schedules.push(PricingSchedule {
            id: Ulid::new(),
            court_id: cs.id,
            day_of_week: 0,
            range: r((17, 0), (22, 0)),
            price: 100_000,
            effective_from: sunday(),
            effective_to: None,
            active: true,
        });
        cs
    }

    fn booking(cs: &CourtState, range: TimeRange, status: BookingStatus, expires: Option<Ms>) -> Booking {
        Booking {
            id: Ulid::new(),
            court_id: cs.id,
            venue_id: cs.venue_id,
            date: sunday(),
            range,
            holder: Holder::Guest { name: "Minh".into(), phone: None },
            status,
            is_paid: status == BookingStatus::Confirmed,
            payment_code: None,
            pending_expires_at: expires,
            total_price: 100_000,
            is_for_transfer: false,
            transfer_status: None,
            transfer_price: None,
            created_at: 0,
        }
    }

    #[test]
    fn subtract_splits_window() {
        let base = r((17, 0), (22, 0));
        let cut = [r((16, 0), (17, 30)), r((18, 0), (19, 0)), r((21, 0), (23, 0))];
        assert_eq!(
            subtract_ranges(&base, &cut),
            vec![r((17, 30), (18, 0)), r((19, 0), (21, 0))]
        );
        assert_eq!(subtract_ranges(&base, &[]), vec![base]);
        assert!(subtract_ranges(&base, &[base]).is_empty());
    }

    #[test]
    fn empty_day_is_one_free_window() {
        let cs = court();
        let sheet = day_sheet(&cs, sunday(), 0);
        assert_eq!(sheet.len(), 1);
        assert_eq!(sheet[0].status, SlotStatus::Free);
        assert_eq!(sheet[0].price, Some(100_000));
    }

    #[test]
    fn booked_segment_splits_window() {
        let mut cs = court();
        let b = booking(&cs, r((18, 0), (19, 0)), BookingStatus::Confirmed, None);
        let id = b.id;
        cs.insert_booking(b);

        let sheet = day_sheet(&cs, sunday(), 0);
        let shape: Vec<_> = sheet.iter().map(|s| (s.range, s.status)).collect();
        assert_eq!(
            shape,
            vec![
                (r((17, 0), (18, 0)), SlotStatus::Free),
                (r((18, 0), (19, 0)), SlotStatus::Booked),
                (r((19, 0), (22, 0)), SlotStatus::Free),
            ]
        );
        assert_eq!(sheet[1].booking.as_ref().map(|s| s.id), Some(id));
        assert_eq!(sheet[1].price, Some(100_000));
    }

    #[test]
    fn lapsed_and_cancelled_bookings_show_free() {
        let mut cs = court();
        let lapsed = booking(&cs, r((18, 0), (19, 0)), BookingStatus::Pending, Some(1_000));
        let cancelled = booking(&cs, r((20, 0), (21, 0)), BookingStatus::Cancelled, None);
        cs.insert_booking(lapsed);
        cs.insert_booking(cancelled);

        let sheet = day_sheet(&cs, sunday(), 1_000);
        assert!(sheet.iter().all(|s| s.status == SlotStatus::Free));

        // One ms earlier the hold is still live
        let sheet = day_sheet(&cs, sunday(), 999);
        assert_eq!(sheet.iter().filter(|s| s.status == SlotStatus::Booked).count(), 1);
    }

    #[test]
    fn unscheduled_booking_is_listed_without_price() {
        let mut cs = court();
        cs.insert_booking(booking(&cs, r((8, 0), (9, 0)), BookingStatus::Confirmed, None));
        let sheet = day_sheet(&cs, sunday(), 0);
        assert_eq!(sheet[0].range, r((8, 0), (9, 0)));
        assert_eq!(sheet[0].status, SlotStatus::Booked);
        assert_eq!(sheet[0].price, None);
    }
}
