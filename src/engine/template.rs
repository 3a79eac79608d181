use std::collections::HashSet;
use std::time::Instant;

use chrono::{Datelike, NaiveDate};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::record_op;

use super::conflict::{validate_span, validate_template_slots};
use super::{Engine, SchedulerError};

/// Wall-clock `date + time`, read as UTC.
fn compose_utc(date: NaiveDate, time: chrono::NaiveTime) -> Ms {
    date.and_time(time).and_utc().timestamp_millis()
}

fn midnight_utc(date: NaiveDate) -> Ms {
    compose_utc(date, chrono::NaiveTime::MIN)
}

/// Dated occurrences of a template over `[from, to)`. With `skip_past_before`,
/// occurrences that end at or before that instant are left out.
pub(crate) fn expand_template(
    template: &WeeklyTemplate,
    from: NaiveDate,
    to: NaiveDate,
    skip_past_before: Option<Ms>,
) -> Vec<(Span, Option<String>)> {
    let mut out = Vec::new();
    for date in from.iter_days().take_while(|d| *d < to) {
        let weekday = date.weekday();
        for ts in template.slots.iter().filter(|ts| ts.weekday == weekday) {
            let start = compose_utc(date, ts.start);
            let end = compose_utc(date, ts.end);
            if let Some(now) = skip_past_before
                && end <= now
            {
                continue;
            }
            out.push((Span::new(start, end), ts.note.clone()));
        }
    }
    out
}

impl Engine {
    /// The specialist's template, or an inactive empty placeholder.
    pub async fn get_template(&self, specialist_id: Ulid) -> TemplateInfo {
        let template = match self.read_specialist(&specialist_id).await {
            Some(st) => st.template.clone(),
            None => None,
        };
        match template {
            Some(t) => TemplateInfo {
                id: Some(t.id),
                is_active: t.is_active,
                slots: t.slots,
            },
            None => TemplateInfo {
                id: None,
                is_active: false,
                slots: Vec::new(),
            },
        }
    }

    /// Replace the whole template. Concurrent upserts serialize; the last one wins.
    pub async fn upsert_template(
        &self,
        specialist_id: Ulid,
        slots: Vec<TemplateSlot>,
        is_active: bool,
    ) -> Result<TemplateInfo, SchedulerError> {
        let started = Instant::now();
        let result = self.upsert_template_inner(specialist_id, slots, is_active).await;
        record_op("upsert_template", started, &result);
        result
    }

    async fn upsert_template_inner(
        &self,
        specialist_id: Ulid,
        slots: Vec<TemplateSlot>,
        is_active: bool,
    ) -> Result<TemplateInfo, SchedulerError> {
        let slots = validate_template_slots(slots)?;
        let now = self.now();

        let mut txn = self.begin(specialist_id).await;
        let created_at = txn.template.as_ref().map_or(now, |t| t.created_at);
        let template = WeeklyTemplate {
            id: Ulid::new(),
            specialist_id,
            is_active,
            slots,
            created_at,
            updated_at: now,
        };
        let info = TemplateInfo {
            id: Some(template.id),
            is_active,
            slots: template.slots.clone(),
        };
        self.commit(&mut txn, Event::TemplateReplaced { template }).await?;
        Ok(info)
    }

    /// Expand the active template into dated slots over `[from, to)`.
    ///
    /// Every stored slot lying wholly inside the range is dropped first,
    /// booked or not; bookings that referenced one keep their span and lose
    /// the reference. Times of day are composed onto the UTC date as-is.
    pub async fn materialize(
        &self,
        specialist_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
        skip_past: bool,
    ) -> Result<MaterializeReport, SchedulerError> {
        let started = Instant::now();
        let result = self.materialize_inner(specialist_id, from, to, skip_past).await;
        record_op("materialize", started, &result);
        result
    }

    async fn materialize_inner(
        &self,
        specialist_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
        skip_past: bool,
    ) -> Result<MaterializeReport, SchedulerError> {
        if to <= from {
            return Err(SchedulerError::validation("range end must be after start"));
        }
        if (to - from).num_days() > MAX_MATERIALIZE_DAYS {
            return Err(SchedulerError::validation(format!(
                "range must not exceed {MAX_MATERIALIZE_DAYS} days"
            )));
        }
        let range = Span::new(midnight_utc(from), midnight_utc(to));
        validate_span(&range)?;

        let mut txn = self.begin(specialist_id).await;
        let template = txn
            .template
            .as_ref()
            .ok_or_else(|| SchedulerError::NotFound {
                entity: "template",
                id: specialist_id,
            })?;
        if !template.is_active {
            return Err(SchedulerError::validation("template is not active"));
        }

        let now = self.now();
        let occurrences = expand_template(template, from, to, skip_past.then_some(now));
        let mut report = MaterializeReport {
            created: 0,
            purged: 0,
            from,
            to,
        };
        if occurrences.is_empty() {
            return Ok(report);
        }

        let purged: HashSet<Ulid> = txn
            .overlapping(&range)
            .filter(|s| range.contains_span(&s.span))
            .map(|s| s.id)
            .collect();

        // Slots straddling the range edges survive the purge and can still collide.
        for (span, _) in &occurrences {
            if let Some(hit) = txn.overlapping(span).find(|s| !purged.contains(&s.id)) {
                return Err(SchedulerError::conflict(format!(
                    "[{}, {}) overlaps existing slot {}",
                    span.start, span.end, hit.id
                )));
            }
        }

        let slots: Vec<Slot> = occurrences
            .into_iter()
            .map(|(span, note)| Slot {
                id: Ulid::new(),
                specialist_id,
                span,
                occupied: false,
                note,
                created_at: now,
                updated_at: now,
            })
            .collect();
        report.created = slots.len();
        report.purged = purged.len();

        self.commit(
            &mut txn,
            Event::TemplateMaterialized {
                specialist_id,
                purged: purged.into_iter().collect(),
                slots,
            },
        )
        .await?;

        metrics::counter!(crate::observability::MATERIALIZED_SLOTS_TOTAL)
            .increment(report.created as u64);
        tracing::info!(
            specialist = %specialist_id,
            %from,
            %to,
            created = report.created,
            purged = report.purged,
            "materialized template"
        );
        Ok(report)
    }
}
