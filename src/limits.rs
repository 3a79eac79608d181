use crate::model::Ms;

pub const MINUTE_MS: Ms = 60_000;
pub const DAY_MS: Ms = 86_400_000;

/// Slot boundaries must fall on multiples of this many minutes.
pub const SLOT_GRANULARITY_MINUTES: u32 = 30;

/// Clock-skew allowance when rejecting slots that start in the past.
pub const DEFAULT_PAST_GRACE_MS: Ms = MINUTE_MS;

pub const MAX_BATCH_SIZE: usize = 1000;
pub const MAX_TEMPLATE_SLOTS: usize = 7 * 48;
pub const MAX_NOTE_LEN: usize = 200;
pub const MAX_MESSAGE_LEN: usize = 1000;
pub const MAX_SUMMARY_LEN: usize = 4000;
pub const MAX_NEXT_STEPS_LEN: usize = 1000;

pub const MAX_MATERIALIZE_DAYS: i64 = 90;
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * DAY_MS;

/// 1970-01-01 .. 9999-12-31, inclusive.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;
