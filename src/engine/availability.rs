use chrono::NaiveDate;

use crate::model::*;

// ── Overlap predicates ────────────────────────────────────────────

/// First reservation in `existing` whose span overlaps `candidate`.
///
/// Status-agnostic: callers pass active reservations only. `candidate` must
/// satisfy `start < end`.
pub fn find_conflict<'a, I>(existing: I, candidate: &DateSpan) -> Option<&'a Reservation>
where
    I: IntoIterator<Item = &'a Reservation>,
{
    existing.into_iter().find(|r| r.span.overlaps(candidate))
}

/// Whether `candidate` overlaps any reservation in `existing`.
/// Back-to-back spans (`a.end == b.start`) do not conflict.
pub fn has_conflict<'a, I>(existing: I, candidate: &DateSpan) -> bool
where
    I: IntoIterator<Item = &'a Reservation>,
{
    find_conflict(existing, candidate).is_some()
}

/// Reservations overlapping the optional window, ordered by start then id.
///
/// A missing bound leaves that side open; no bounds returns everything.
/// A window with `start >= end` is empty and matches nothing.
pub fn list_overlapping<'a, I>(
    existing: I,
    window_start: Option<NaiveDate>,
    window_end: Option<NaiveDate>,
) -> Vec<Reservation>
where
    I: IntoIterator<Item = &'a Reservation>,
{
    if let (Some(ws), Some(we)) = (window_start, window_end)
        && ws >= we
    {
        return Vec::new();
    }

    let mut hits: Vec<Reservation> = existing
        .into_iter()
        .filter(|r| window_end.is_none_or(|we| r.span.start < we))
        .filter(|r| window_start.is_none_or(|ws| ws < r.span.end))
        .cloned()
        .collect();
    hits.sort_by_key(|r| (r.span.start, r.id));
    hits
}

// ── Calendar helpers ──────────────────────────────────────────────

/// Free sub-ranges of `window` not covered by any of `existing`.
pub fn free_spans<'a, I>(existing: I, window: &DateSpan) -> Vec<DateSpan>
where
    I: IntoIterator<Item = &'a Reservation>,
{
    let taken = taken_within(existing, window);
    subtract_intervals(&[*window], &taken)
}

/// Every day inside `window` covered by one of `existing`, ascending.
pub fn blocked_days<'a, I>(existing: I, window: &DateSpan) -> Vec<NaiveDate>
where
    I: IntoIterator<Item = &'a Reservation>,
{
    taken_within(existing, window)
        .iter()
        .flat_map(DateSpan::iter_days)
        .collect()
}

/// Reservation spans clamped to `window`, sorted and merged.
fn taken_within<'a, I>(existing: I, window: &DateSpan) -> Vec<DateSpan>
where
    I: IntoIterator<Item = &'a Reservation>,
{
    let mut spans: Vec<DateSpan> = existing
        .into_iter()
        .filter(|r| r.span.overlaps(window))
        .map(|r| DateSpan::new(r.span.start.max(window.start), r.span.end.min(window.end)))
        .collect();
    spans.sort_by_key(|s| s.start);
    merge_overlapping(&spans)
}

/// Merge sorted overlapping/adjacent spans into disjoint spans.
pub fn merge_overlapping(sorted: &[DateSpan]) -> Vec<DateSpan> {
    let mut merged: Vec<DateSpan> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`. Both inputs sorted and disjoint.
pub fn subtract_intervals(base: &[DateSpan], to_remove: &[DateSpan]) -> Vec<DateSpan> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(DateSpan::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(DateSpan::new(current_start, current_end));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use ulid::Ulid;

    use super::*;

    fn jan(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn span(start: NaiveDate, end: NaiveDate) -> DateSpan {
        DateSpan::new(start, end)
    }

    fn booked(start: NaiveDate, end: NaiveDate) -> Reservation {
        booked_with(start, end, ReservationStatus::Confirmed)
    }

    fn booked_with(start: NaiveDate, end: NaiveDate, status: ReservationStatus) -> Reservation {
        Reservation {
            id: Ulid::new(),
            car_id: Ulid::nil(),
            renter_id: "renter".into(),
            span: DateSpan::new(start, end),
            status,
            total_price_cents: None,
        }
    }

    fn active(all: &[Reservation]) -> impl Iterator<Item = &Reservation> {
        all.iter().filter(|r| r.is_active())
    }

    // ── has_conflict ──────────────────────────────────────

    #[test]
    fn back_to_back_does_not_conflict() {
        let existing = [booked(jan(10), jan(15))];
        assert!(!has_conflict(&existing, &span(jan(15), jan(20))));
        assert!(!has_conflict(&existing, &span(jan(5), jan(10))));
    }

    #[test]
    fn contained_candidate_conflicts() {
        let existing = [booked(jan(10), jan(20))];
        assert!(has_conflict(&existing, &span(jan(12), jan(14))));
    }

    #[test]
    fn containing_candidate_conflicts() {
        let existing = [booked(jan(12), jan(14))];
        assert!(has_conflict(&existing, &span(jan(10), jan(20))));
    }

    #[test]
    fn partial_overlaps_conflict() {
        let existing = [booked(jan(10), jan(15))];
        // starts inside
        assert!(has_conflict(&existing, &span(jan(14), jan(18))));
        // ends inside
        assert!(has_conflict(&existing, &span(jan(8), jan(11))));
        // identical
        assert!(has_conflict(&existing, &span(jan(10), jan(15))));
    }

    #[test]
    fn disjoint_never_conflicts() {
        let existing = [booked(jan(1), jan(5))];
        assert!(!has_conflict(&existing, &span(jan(10), jan(15))));
    }

    #[test]
    fn empty_set_never_conflicts() {
        let existing: [Reservation; 0] = [];
        assert!(!has_conflict(&existing, &span(jan(1), jan(31))));
    }

    #[test]
    fn conflict_is_symmetric() {
        let spans = [
            span(jan(1), jan(5)),
            span(jan(3), jan(8)),
            span(jan(5), jan(10)),
            span(jan(2), jan(4)),
            span(jan(10), jan(20)),
            span(jan(12), jan(14)),
            span(jan(1), jan(31)),
        ];
        for a in &spans {
            for b in &spans {
                let ra = [booked(a.start, a.end)];
                let rb = [booked(b.start, b.end)];
                assert_eq!(
                    has_conflict(&ra, b),
                    has_conflict(&rb, a),
                    "asymmetric for {a} vs {b}"
                );
            }
        }
    }

    #[test]
    fn reduced_predicate_matches_three_case_form() {
        // start-inside OR end-inside OR fully-contains, inclusive start / exclusive end.
        fn three_case(existing: &DateSpan, c: &DateSpan) -> bool {
            let start_inside = c.start >= existing.start && c.start < existing.end;
            let end_inside = c.end > existing.start && c.end <= existing.end;
            let contains = c.start <= existing.start && c.end >= existing.end;
            start_inside || end_inside || contains
        }
        let existing = span(jan(10), jan(15));
        for s in 1..=25 {
            for e in (s + 1)..=26 {
                let c = span(jan(s), jan(e));
                assert_eq!(
                    has_conflict(&[booked(existing.start, existing.end)], &c),
                    three_case(&existing, &c),
                    "mismatch for {c}"
                );
            }
        }
    }

    #[test]
    fn cancelled_never_blocks_once_filtered() {
        let all = [booked_with(jan(10), jan(20), ReservationStatus::Cancelled)];
        assert!(!has_conflict(active(&all), &span(jan(12), jan(14))));
    }

    #[test]
    fn find_conflict_reports_the_blocker() {
        let existing = [booked(jan(1), jan(5)), booked(jan(15), jan(20))];
        let hit = find_conflict(&existing, &span(jan(18), jan(22))).unwrap();
        assert_eq!(hit.id, existing[1].id);
    }

    // ── list_overlapping ──────────────────────────────────

    #[test]
    fn list_without_window_returns_all_sorted() {
        let existing = [booked(jan(20), jan(22)), booked(jan(1), jan(3)), booked(jan(10), jan(12))];
        let listed = list_overlapping(&existing, None, None);
        let starts: Vec<_> = listed.iter().map(|r| r.span.start).collect();
        assert_eq!(starts, vec![jan(1), jan(10), jan(20)]);
    }

    #[test]
    fn list_with_window_uses_half_open_overlap() {
        let existing = [
            booked(jan(1), jan(5)),   // ends at window start, excluded
            booked(jan(4), jan(6)),   // straddles start
            booked(jan(10), jan(12)), // inside
            booked(jan(15), jan(18)), // starts at window end, excluded
        ];
        let listed = list_overlapping(&existing, Some(jan(5)), Some(jan(15)));
        let starts: Vec<_> = listed.iter().map(|r| r.span.start).collect();
        assert_eq!(starts, vec![jan(4), jan(10)]);
    }

    #[test]
    fn list_with_open_ended_window() {
        let existing = [booked(jan(1), jan(5)), booked(jan(10), jan(12))];
        assert_eq!(list_overlapping(&existing, Some(jan(6)), None).len(), 1);
        assert_eq!(list_overlapping(&existing, None, Some(jan(6))).len(), 1);
    }

    #[test]
    fn list_with_degenerate_window_is_empty() {
        let existing = [booked(jan(1), jan(31))];
        assert!(list_overlapping(&existing, Some(jan(10)), Some(jan(10))).is_empty());
        assert!(list_overlapping(&existing, Some(jan(12)), Some(jan(10))).is_empty());
    }

    #[test]
    fn list_ties_break_on_id() {
        let mut a = booked(jan(10), jan(12));
        let mut b = booked(jan(10), jan(11));
        a.id = Ulid::from_parts(9, 9);
        b.id = Ulid::from_parts(1, 1);
        let listed = list_overlapping(&[a.clone(), b.clone()], None, None);
        assert_eq!(listed[0].id, b.id);
        assert_eq!(listed[1].id, a.id);
    }

    #[test]
    fn list_is_idempotent() {
        let existing = [booked(jan(3), jan(4)), booked(jan(1), jan(2)), booked(jan(3), jan(9))];
        let first = list_overlapping(&existing, Some(jan(1)), Some(jan(31)));
        let second = list_overlapping(&existing, Some(jan(1)), Some(jan(31)));
        assert_eq!(first, second);
    }

    // ── free_spans / blocked_days ─────────────────────────

    #[test]
    fn free_spans_punch_out_reservations() {
        let existing = [booked(jan(5), jan(8)), booked(jan(8), jan(10)), booked(jan(20), jan(25))];
        let free = free_spans(&existing, &span(jan(1), jan(22)));
        assert_eq!(free, vec![span(jan(1), jan(5)), span(jan(10), jan(20))]);
    }

    #[test]
    fn free_spans_empty_when_fully_booked() {
        let existing = [booked(jan(1), jan(31))];
        assert!(free_spans(&existing, &span(jan(5), jan(10))).is_empty());
    }

    #[test]
    fn blocked_days_are_clamped_and_deduplicated() {
        let existing = [booked(jan(3), jan(6)), booked(jan(4), jan(7)), booked(jan(30), jan(31))];
        let days = blocked_days(&existing, &span(jan(4), jan(10)));
        assert_eq!(days, vec![jan(4), jan(5), jan(6)]);
    }

    // ── merge / subtract ──────────────────────────────────

    #[test]
    fn merge_overlapping_adjacent() {
        let spans = vec![span(jan(1), jan(3)), span(jan(3), jan(5)), span(jan(7), jan(9))];
        assert_eq!(merge_overlapping(&spans), vec![span(jan(1), jan(5)), span(jan(7), jan(9))]);
    }

    #[test]
    fn subtract_middle_punch() {
        let result = subtract_intervals(&[span(jan(1), jan(20))], &[span(jan(5), jan(10))]);
        assert_eq!(result, vec![span(jan(1), jan(5)), span(jan(10), jan(20))]);
    }

    #[test]
    fn subtract_full_overlap() {
        let result = subtract_intervals(&[span(jan(5), jan(10))], &[span(jan(1), jan(20))]);
        assert!(result.is_empty());
    }
}
