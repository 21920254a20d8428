use chrono::NaiveDate;

use crate::model::{DateRange, VehicleCalendar};

// ── Blocked-set arithmetic ────────────────────────────────────────

/// Fold a set of ranges into the smallest set of non-overlapping,
/// non-touching ranges covering the same days. Deterministic and stable
/// under input reordering.
pub fn merge_ranges(mut ranges: Vec<DateRange>) -> Vec<DateRange> {
    ranges.sort();
    let mut merged: Vec<DateRange> = Vec::new();
    for range in ranges {
        if let Some(last) = merged.last_mut()
            && last.touches(&range)
        {
            last.end = last.end.max(range.end);
            continue;
        }
        merged.push(range);
    }
    merged
}

/// Binary search over a merged (sorted, disjoint) range set.
pub fn ranges_contain_day(merged: &[DateRange], day: NaiveDate) -> bool {
    let idx = merged.partition_point(|r| r.end < day);
    merged.get(idx).is_some_and(|r| r.contains_day(day))
}

/// The effective blocked set for a vehicle: non-cancelled reservations
/// unioned with cached events of active links, merged.
pub fn effective_blocked(cal: &VehicleCalendar) -> Vec<DateRange> {
    let mut ranges: Vec<DateRange> = cal.blocking_reservations().map(|r| r.range).collect();
    ranges.extend(cal.blocking_events().map(|e| e.range));
    merge_ranges(ranges)
}
