use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

// ── Availability Algorithm ────────────────────────────────────────

/// Sweep-line events for every active claim and lodger overlapping `window`, clamped
/// to it. `+units` at check-in, `-units` at check-out, sorted by date with departures
/// first so a same-day turnover never stacks.
fn load_events(rs: &RoomTypeState, window: &Stay, exclude: Option<Ulid>) -> Vec<(NaiveDate, i64)> {
    let claims = rs
        .overlapping(window)
        .filter(|c| exclude != Some(c.id))
        .map(|c| (c.stay, i64::from(c.occupied_units())));
    let lodgers = rs
        .lodgers_overlapping(window)
        .filter(|l| exclude != Some(l.reservation_id))
        .map(|l| (l.stay, 1));

    let mut events: Vec<(NaiveDate, i64)> = Vec::new();
    for (stay, units) in claims.chain(lodgers) {
        let Some(clamped) = stay.clamp(window) else {
            continue;
        };
        events.push((clamped.check_in, units));
        events.push((clamped.check_out, -units));
    }
    events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
    events
}

fn clamp_load(load: i64) -> u32 {
    u32::try_from(load.max(0)).unwrap_or(u32::MAX)
}

/// Maximum simultaneous units occupied during `window`.
pub fn peak_load(rs: &RoomTypeState, window: &Stay, exclude: Option<Ulid>) -> u32 {
    let mut load: i64 = 0;
    let mut peak: i64 = 0;
    for (_, delta) in load_events(rs, window, exclude) {
        load += delta;
        peak = peak.max(load);
    }
    clamp_load(peak)
}

/// `qty - peak`, clamped to 0 (a forced override can push the peak past `qty`).
pub fn free_units(rs: &RoomTypeState, window: &Stay, exclude: Option<Ulid>) -> u32 {
    rs.room_type
        .qty
        .saturating_sub(peak_load(rs, window, exclude))
}

/// Free units for every night of `window`.
pub fn nightly_free_units(rs: &RoomTypeState, window: &Stay) -> Vec<NightlyAvailability> {
    let events = load_events(rs, window, None);
    let qty = rs.room_type.qty;
    let mut result = Vec::with_capacity(usize::try_from(window.nights()).unwrap_or(0));
    let mut load: i64 = 0;
    let mut next = 0;

    for night in window.each_night() {
        while next < events.len() && events[next].0 <= night {
            load += events[next].1;
            next += 1;
        }
        result.push(NightlyAvailability {
            night,
            free_units: qty.saturating_sub(clamp_load(load)),
        });
    }
    result
}

/// Sweep-line: maximal date ranges inside `window` where no unit is free.
pub fn sold_out_spans(rs: &RoomTypeState, window: &Stay) -> Vec<Stay> {
    let qty = i64::from(rs.room_type.qty);
    let mut result = Vec::new();
    let mut load: i64 = 0;
    let mut saturated_start: Option<NaiveDate> = None;

    for (date, delta) in load_events(rs, window, None) {
        load += delta;
        if load >= qty && saturated_start.is_none() {
            saturated_start = Some(date);
        } else if load < qty
            && let Some(start) = saturated_start.take()
            && date > start
        {
            result.push(Stay {
                check_in: start,
                check_out: date,
            });
        }
    }
    result
}

/// Busiest night over every non-cancelled claim and lodger the type has ever held,
/// with its load. `None` when nothing holds inventory.
pub fn busiest_night(rs: &RoomTypeState) -> Option<(NaiveDate, u32)> {
    let stays = || {
        rs.claims
            .iter()
            .filter(|c| c.status.holds_inventory())
            .map(|c| c.stay)
            .chain(rs.lodgers.iter().map(|l| l.stay))
    };
    let window = Stay {
        check_in: stays().map(|s| s.check_in).min()?,
        check_out: stays().map(|s| s.check_out).max()?,
    };

    let mut load: i64 = 0;
    let mut busiest: Option<(NaiveDate, i64)> = None;
    for (date, delta) in load_events(rs, &window, None) {
        load += delta;
        if delta > 0 && busiest.is_none_or(|(_, peak)| load > peak) {
            busiest = Some((date, load));
        }
    }
    busiest.map(|(night, peak)| (night, clamp_load(peak)))
}

/// Lodgers in a room realising `index` whose stay overlaps `window`.
pub fn unit_lodgers<'a>(
    rs: &'a RoomTypeState,
    index: u32,
    window: &'a Stay,
) -> impl Iterator<Item = &'a Lodger> + 'a {
    rs.lodgers_overlapping(window)
        .filter(move |l| l.unit_index == Some(index))
}

/// Claims bound to `index` that overlap `window`, excluding `exclude`.
pub fn unit_claims<'a>(
    rs: &'a RoomTypeState,
    index: u32,
    window: &'a Stay,
    exclude: Option<Ulid>,
) -> impl Iterator<Item = &'a ReservationClaim> + 'a {
    rs.overlapping(window)
        .filter(move |c| c.is_bound_to(index) && exclude != Some(c.id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, m, day).unwrap()
    }

    fn stay(a: NaiveDate, b: NaiveDate) -> Stay {
        Stay::new(a, b).unwrap()
    }

    fn make_room_type(qty: u32, claims: Vec<ReservationClaim>) -> RoomTypeState {
        let mut rs = RoomTypeState::new(RoomType {
            id: Ulid::new(),
            name: None,
            qty,
            price_per_night: 0,
        });
        for c in claims {
            rs.insert_claim(c);
        }
        rs
    }

    fn bound(index: u32, a: NaiveDate, b: NaiveDate) -> ReservationClaim {
        ReservationClaim {
            id: Ulid::new(),
            room_type_id: Ulid::new(),
            assigned_unit: Some(UnitRef {
                room_type_id: Ulid::new(),
                index,
            }),
            units_requested: 1,
            stay: stay(a, b),
            status: ClaimStatus::Confirmed,
            forced: false,
            overrides: Vec::new(),
            total_price: 0,
            created_by: None,
        }
    }

    fn unassigned(units: u32, a: NaiveDate, b: NaiveDate) -> ReservationClaim {
        ReservationClaim {
            assigned_unit: None,
            units_requested: units,
            ..bound(0, a, b)
        }
    }

    #[test]
    fn empty_claim_set_is_fully_free() {
        let rs = make_room_type(4, vec![]);
        assert_eq!(free_units(&rs, &stay(d(1, 1), d(1, 31)), None), 4);
    }

    #[test]
    fn one_overlapping_night_takes_one_unit() {
        // Unit 0 busy Jan 10-12, query Jan 11-13.
        let rs = make_room_type(2, vec![bound(0, d(1, 10), d(1, 12))]);
        assert_eq!(free_units(&rs, &stay(d(1, 11), d(1, 13)), None), 1);
    }

    #[test]
    fn disjoint_claims_do_not_stack() {
        let rs = make_room_type(
            1,
            vec![bound(0, d(1, 1), d(1, 3)), bound(0, d(1, 3), d(1, 5))],
        );
        assert_eq!(peak_load(&rs, &stay(d(1, 1), d(1, 5)), None), 1);
    }

    #[test]
    fn unassigned_claims_count_requested_units() {
        let rs = make_room_type(
            5,
            vec![
                unassigned(2, d(1, 1), d(1, 5)),
                bound(3, d(1, 2), d(1, 4)),
                unassigned(1, d(1, 4), d(1, 6)),
            ],
        );
        // Jan 2-4: 2 + 1; Jan 4: 2 + 1 (bound ended) → peak 3.
        assert_eq!(peak_load(&rs, &stay(d(1, 1), d(1, 6)), None), 3);
        assert_eq!(free_units(&rs, &stay(d(1, 1), d(1, 6)), None), 2);
    }

    #[test]
    fn exclude_ignores_own_claim() {
        let mine = bound(0, d(1, 1), d(1, 3));
        let id = mine.id;
        let rs = make_room_type(1, vec![mine]);
        let window = stay(d(1, 1), d(1, 3));
        assert_eq!(free_units(&rs, &window, None), 0);
        assert_eq!(free_units(&rs, &window, Some(id)), 1);
    }

    #[test]
    fn overbooked_clamps_to_zero() {
        let rs = make_room_type(
            1,
            vec![bound(0, d(1, 1), d(1, 3)), bound(0, d(1, 1), d(1, 3))],
        );
        assert_eq!(free_units(&rs, &stay(d(1, 1), d(1, 3)), None), 0);
    }

    #[test]
    fn cancelled_claims_are_ignored() {
        let mut c = bound(0, d(1, 1), d(1, 3));
        c.status = ClaimStatus::Cancelled;
        let rs = make_room_type(1, vec![c]);
        assert_eq!(free_units(&rs, &stay(d(1, 1), d(1, 3)), None), 1);
    }

    #[test]
    fn nightly_calendar() {
        let rs = make_room_type(
            2,
            vec![bound(0, d(1, 2), d(1, 4)), unassigned(1, d(1, 3), d(1, 5))],
        );
        let nights = nightly_free_units(&rs, &stay(d(1, 1), d(1, 6)));
        let free: Vec<u32> = nights.iter().map(|n| n.free_units).collect();
        assert_eq!(free, vec![2, 1, 0, 1, 2]);
        assert_eq!(nights[0].night, d(1, 1));
    }

    #[test]
    fn nightly_calendar_with_claim_starting_before_window() {
        let rs = make_room_type(1, vec![bound(0, d(1, 1), d(1, 10))]);
        let nights = nightly_free_units(&rs, &stay(d(1, 5), d(1, 7)));
        assert!(nights.iter().all(|n| n.free_units == 0));
    }

    #[test]
    fn sold_out_spans_basic() {
        let rs = make_room_type(
            2,
            vec![bound(0, d(1, 1), d(1, 5)), bound(1, d(1, 3), d(1, 8))],
        );
        let sold = sold_out_spans(&rs, &stay(d(1, 1), d(1, 10)));
        assert_eq!(sold, vec![stay(d(1, 3), d(1, 5))]);
    }

    #[test]
    fn sold_out_spans_empty() {
        let rs = make_room_type(2, vec![]);
        assert!(sold_out_spans(&rs, &stay(d(1, 1), d(1, 10))).is_empty());
    }

    #[test]
    fn unit_claims_filters_by_index() {
        let rs = make_room_type(
            2,
            vec![bound(0, d(1, 1), d(1, 5)), bound(1, d(1, 1), d(1, 5))],
        );
        let window = stay(d(1, 2), d(1, 3));
        assert_eq!(unit_claims(&rs, 1, &window, None).count(), 1);
        let unit1 = unit_claims(&rs, 1, &window, None).next().unwrap().id;
        assert_eq!(unit_claims(&rs, 1, &window, Some(unit1)).count(), 0);
    }

    #[test]
    fn lodgers_take_one_unit_each() {
        let mut rs = make_room_type(2, vec![bound(0, d(1, 1), d(1, 5))]);
        let guest = Ulid::new();
        rs.add_lodger(Lodger {
            reservation_id: guest,
            unit_index: Some(1),
            stay: stay(d(1, 3), d(1, 6)),
        });
        let window = stay(d(1, 1), d(1, 7));
        assert_eq!(peak_load(&rs, &window, None), 2);
        assert_eq!(peak_load(&rs, &window, Some(guest)), 1);
        assert_eq!(unit_lodgers(&rs, 1, &window).count(), 1);
        assert_eq!(unit_lodgers(&rs, 0, &window).count(), 0);

        rs.remove_lodger(&guest);
        assert_eq!(free_units(&rs, &stay(d(1, 5), d(1, 6)), None), 2);
    }

    #[test]
    fn busiest_night_finds_first_peak() {
        assert_eq!(busiest_night(&make_room_type(3, vec![])), None);

        let mut cancelled = unassigned(5, d(1, 1), d(1, 9));
        cancelled.status = ClaimStatus::Cancelled;
        let rs = make_room_type(
            3,
            vec![
                unassigned(2, d(1, 2), d(1, 5)),
                bound(0, d(1, 4), d(1, 6)),
                bound(0, d(1, 6), d(1, 8)),
                cancelled,
            ],
        );
        assert_eq!(busiest_night(&rs), Some((d(1, 4), 3)));
    }
}
