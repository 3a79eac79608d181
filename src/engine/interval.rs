use chrono::{NaiveTime, Timelike};

use crate::model::*;

// ── Interval Algebra ──────────────────────────────────────────────

/// Half-open overlap: touching endpoints do not overlap.
pub fn overlaps(a_start: Ms, a_end: Ms, b_start: Ms, b_end: Ms) -> bool {
    a_start < b_end && b_start < a_end
}

/// True iff the instant's minute is a multiple of `granularity_minutes` and
/// seconds/sub-seconds are zero. Granularity must divide an hour.
pub fn aligned(instant: Ms, granularity_minutes: u32) -> bool {
    debug_assert!(granularity_minutes > 0 && 60 % granularity_minutes == 0);
    let step = granularity_minutes as Ms * 60_000;
    instant.rem_euclid(step) == 0
}

/// Same rule as [`aligned`] for a wall-clock time of day.
pub fn time_aligned(t: NaiveTime, granularity_minutes: u32) -> bool {
    t.minute() % granularity_minutes == 0 && t.second() == 0 && t.nanosecond() == 0
}

/// Given spans sorted by start, return the index `i` of the first pair
/// `(i - 1, i)` that overlaps.
pub fn first_adjacent_overlap(sorted: &[Span]) -> Option<usize> {
    (1..sorted.len()).find(|&i| sorted[i - 1].overlaps(&sorted[i]))
}
