use std::collections::BTreeMap;

use chrono::Weekday;

use crate::limits::*;
use crate::model::*;

use super::interval::{aligned, first_adjacent_overlap, overlaps, time_aligned};
use super::SchedulerError;

pub(crate) fn validate_span(span: &Span) -> Result<(), SchedulerError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(SchedulerError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// `[from, to)` read window: ordered, in range, not wider than a year.
pub(crate) fn validate_window(from: Ms, to: Ms) -> Result<Span, SchedulerError> {
    if to <= from {
        return Err(SchedulerError::validation("window end must be after start"));
    }
    let window = Span::new(from, to);
    validate_span(&window)?;
    if window.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(SchedulerError::LimitExceeded("query window too wide"));
    }
    Ok(window)
}

pub(crate) fn validate_text(
    field: &'static str,
    value: Option<&str>,
    max_len: usize,
) -> Result<(), SchedulerError> {
    if let Some(v) = value
        && v.chars().count() > max_len
    {
        return Err(SchedulerError::validation(format!(
            "{field} longer than {max_len} characters"
        )));
    }
    Ok(())
}

/// Check one requested slot on its own: ordering, alignment, not in the past.
fn validate_new_slot(slot: &NewSlot, now: Ms, grace: Ms) -> Result<Span, SchedulerError> {
    if slot.end <= slot.start {
        return Err(SchedulerError::validation(format!(
            "slot end {} must be after start {}",
            slot.end, slot.start
        )));
    }
    let span = Span::new(slot.start, slot.end);
    validate_span(&span)?;
    if !aligned(slot.start, SLOT_GRANULARITY_MINUTES) || !aligned(slot.end, SLOT_GRANULARITY_MINUTES)
    {
        return Err(SchedulerError::validation(format!(
            "slot boundaries must fall on {SLOT_GRANULARITY_MINUTES}-minute marks"
        )));
    }
    if slot.start < now - grace {
        return Err(SchedulerError::validation("slot starts in the past"));
    }
    validate_text("note", slot.note.as_deref(), MAX_NOTE_LEN)?;
    Ok(span)
}

/// Validate a creation batch and return it sorted by start.
/// Fails on the first bad slot or on any overlap inside the batch.
pub(crate) fn validate_batch(
    batch: Vec<NewSlot>,
    now: Ms,
    grace: Ms,
) -> Result<Vec<(Span, Option<String>)>, SchedulerError> {
    if batch.is_empty() {
        return Err(SchedulerError::validation("no slots given"));
    }
    if batch.len() > MAX_BATCH_SIZE {
        return Err(SchedulerError::LimitExceeded("too many slots in one batch"));
    }
    let mut checked = Vec::with_capacity(batch.len());
    for slot in batch {
        let span = validate_new_slot(&slot, now, grace)?;
        checked.push((span, slot.note));
    }
    checked.sort_by_key(|(span, _)| span.start);
    let spans: Vec<Span> = checked.iter().map(|(span, _)| *span).collect();
    if let Some(i) = first_adjacent_overlap(&spans) {
        return Err(SchedulerError::validation(format!(
            "requested slots overlap: [{}, {}) and [{}, {})",
            spans[i - 1].start,
            spans[i - 1].end,
            spans[i].start,
            spans[i].end
        )));
    }
    Ok(checked)
}

/// Reject if any of `spans` intersects a slot already stored for the specialist.
pub(crate) fn check_no_overlap(st: &SpecialistState, spans: &[Span]) -> Result<(), SchedulerError> {
    let (Some(min_start), Some(max_end)) = (
        spans.iter().map(|s| s.start).min(),
        spans.iter().map(|s| s.end).max(),
    ) else {
        return Ok(());
    };
    let bounds = Span::new(min_start, max_end);
    for existing in st.overlapping(&bounds) {
        if let Some(hit) = spans.iter().find(|s| {
            overlaps(s.start, s.end, existing.span.start, existing.span.end)
        }) {
            return Err(SchedulerError::conflict(format!(
                "[{}, {}) overlaps existing slot {}",
                hit.start, hit.end, existing.id
            )));
        }
    }
    Ok(())
}

/// Validate template entries and return them ordered by (weekday from Sunday, start).
/// Within a weekday, a pair with `prev.end > next.start` is rejected.
pub(crate) fn validate_template_slots(
    mut slots: Vec<TemplateSlot>,
) -> Result<Vec<TemplateSlot>, SchedulerError> {
    if slots.len() > MAX_TEMPLATE_SLOTS {
        return Err(SchedulerError::LimitExceeded("too many template slots"));
    }
    for ts in &slots {
        if ts.end <= ts.start {
            return Err(SchedulerError::validation(format!(
                "{} {}: end must be after start",
                ts.weekday, ts.start
            )));
        }
        if !time_aligned(ts.start, SLOT_GRANULARITY_MINUTES)
            || !time_aligned(ts.end, SLOT_GRANULARITY_MINUTES)
        {
            return Err(SchedulerError::validation(format!(
                "{} {}-{}: times must fall on {SLOT_GRANULARITY_MINUTES}-minute marks",
                ts.weekday, ts.start, ts.end
            )));
        }
        validate_text("note", ts.note.as_deref(), MAX_NOTE_LEN)?;
    }

    slots.sort_by_key(TemplateSlot::sort_key);
    let mut by_day: BTreeMap<u32, Vec<&TemplateSlot>> = BTreeMap::new();
    for ts in &slots {
        by_day
            .entry(ts.weekday.num_days_from_sunday())
            .or_default()
            .push(ts);
    }
    for day in by_day.values() {
        for pair in day.windows(2) {
            let (prev, next) = (pair[0], pair[1]);
            if prev.end > next.start {
                return Err(SchedulerError::validation(format!(
                    "{}: {}-{} overlaps {}-{}",
                    weekday_name(prev.weekday),
                    prev.start,
                    prev.end,
                    next.start,
                    next.end
                )));
            }
        }
    }
    Ok(slots)
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;
    use ulid::Ulid;

    const M: Ms = MINUTE_MS;
    const NOW: Ms = 1_000 * DAY_MS;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn batch_sorted_and_checked() {
        let batch = vec![
            NewSlot::new(NOW + 60 * M, NOW + 90 * M),
            NewSlot::new(NOW, NOW + 30 * M),
        ];
        let out = validate_batch(batch, NOW, MINUTE_MS).unwrap();
        assert_eq!(out[0].0.start, NOW);
        assert_eq!(out[1].0.start, NOW + 60 * M);
    }

    #[test]
    fn batch_rejections() {
        assert!(matches!(
            validate_batch(vec![], NOW, 0),
            Err(SchedulerError::Validation(_))
        ));
        // end == start
        assert!(validate_batch(vec![NewSlot::new(NOW, NOW)], NOW, 0).is_err());
        // misaligned
        assert!(validate_batch(vec![NewSlot::new(NOW + 15 * M, NOW + 45 * M)], NOW, 0).is_err());
        // in the past beyond grace
        assert!(validate_batch(vec![NewSlot::new(NOW - 30 * M, NOW)], NOW, MINUTE_MS).is_err());
        // self-overlap
        let err = validate_batch(
            vec![
                NewSlot::new(NOW, NOW + 60 * M),
                NewSlot::new(NOW + 30 * M, NOW + 90 * M),
            ],
            NOW,
            0,
        )
        .unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));
        // note too long
        let mut s = NewSlot::new(NOW, NOW + 30 * M);
        s.note = Some("x".repeat(MAX_NOTE_LEN + 1));
        assert!(validate_batch(vec![s], NOW, 0).is_err());
    }

    #[test]
    fn grace_admits_slot_starting_just_now() {
        let out = validate_batch(vec![NewSlot::new(NOW, NOW + 30 * M)], NOW + 30_000, MINUTE_MS);
        assert!(out.is_ok());
    }

    #[test]
    fn adjacent_slots_are_not_conflicts() {
        let mut st = SpecialistState::new(Ulid::new());
        st.insert_slot(Slot {
            id: Ulid::new(),
            specialist_id: st.id,
            span: Span::new(NOW, NOW + 30 * M),
            occupied: false,
            note: None,
            created_at: 0,
            updated_at: 0,
        });
        assert!(check_no_overlap(&st, &[Span::new(NOW + 30 * M, NOW + 60 * M)]).is_ok());
        assert!(check_no_overlap(&st, &[Span::new(NOW - 30 * M, NOW)]).is_ok());
        assert!(matches!(
            check_no_overlap(&st, &[Span::new(NOW - 30 * M, NOW + 60 * M)]),
            Err(SchedulerError::Conflict(_))
        ));
        assert!(check_no_overlap(&st, &[]).is_ok());
    }

    #[test]
    fn template_slots_ordering_and_overlap() {
        let sorted = validate_template_slots(vec![
            TemplateSlot::new(Weekday::Mon, t(10, 0), t(10, 30)),
            TemplateSlot::new(Weekday::Sun, t(9, 0), t(9, 30)),
            TemplateSlot::new(Weekday::Mon, t(9, 0), t(10, 0)),
        ])
        .unwrap();
        assert_eq!(sorted[0].weekday, Weekday::Sun);
        assert_eq!(sorted[1].start, t(9, 0));
        assert_eq!(sorted[2].start, t(10, 0));

        // same times on different days are fine
        assert!(validate_template_slots(vec![
            TemplateSlot::new(Weekday::Mon, t(9, 0), t(10, 0)),
            TemplateSlot::new(Weekday::Tue, t(9, 0), t(10, 0)),
        ])
        .is_ok());

        let err = validate_template_slots(vec![
            TemplateSlot::new(Weekday::Wed, t(9, 0), t(10, 0)),
            TemplateSlot::new(Weekday::Wed, t(9, 30), t(10, 30)),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("Wednesday"));

        assert!(validate_template_slots(vec![TemplateSlot::new(Weekday::Thu, t(9, 15), t(9, 45))]).is_err());
        assert!(validate_template_slots(vec![TemplateSlot::new(Weekday::Thu, t(10, 0), t(9, 30))]).is_err());
        assert!(validate_template_slots(vec![]).unwrap().is_empty());
    }
}
