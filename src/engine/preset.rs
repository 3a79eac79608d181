use std::time::Instant;

use chrono::{NaiveTime, TimeDelta, Weekday};
use ulid::Ulid;

use crate::limits::SLOT_GRANULARITY_MINUTES;
use crate::model::*;
use crate::observability::record_op;

use super::{Engine, SchedulerError};

/// Named weekly patterns a specialist can start a template from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Preset {
    Weekdays,
    Evenings,
    Weekends,
    /// Mon/Wed/Fri mornings plus Tue/Thu late afternoons, fixed times.
    Mixed,
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresetInfo {
    pub code: &'static str,
    pub name: &'static str,
    pub slot_minutes: u32,
}

/// Input of [`Engine::generate_from_preset`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresetRequest {
    pub preset_code: String,
    /// Overrides the preset's own days. Ignored by `mixed` and `empty`.
    pub days: Option<Vec<Weekday>>,
    pub start: NaiveTime,
    pub end: NaiveTime,
    /// 0 means the default length.
    pub slot_minutes: u32,
    /// `[from, to)` local times; generated slots touching a break are skipped.
    pub breaks: Vec<(NaiveTime, NaiveTime)>,
    pub note: Option<String>,
    pub is_active: bool,
}

const WEEKDAYS: [Weekday; 5] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
];

/// Built at compile time, so a bad hour or minute fails the build.
const fn hm(h: u32, m: u32) -> NaiveTime {
    match NaiveTime::from_hms_opt(h, m, 0) {
        Some(t) => t,
        None => panic!("invalid preset time"),
    }
}

const MIXED_MORNING: (NaiveTime, NaiveTime) = (hm(10, 0), hm(13, 0));
const MIXED_AFTERNOON: (NaiveTime, NaiveTime) = (hm(16, 0), hm(20, 0));

impl Preset {
    pub const ALL: [Preset; 5] = [
        Preset::Weekdays,
        Preset::Evenings,
        Preset::Weekends,
        Preset::Mixed,
        Preset::Empty,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Preset::Weekdays => "weekdays_10_18",
            Preset::Evenings => "evenings_18_21",
            Preset::Weekends => "weekends_10_16",
            Preset::Mixed => "mixed",
            Preset::Empty => "empty",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Preset::Weekdays => "Weekdays 10:00-18:00",
            Preset::Evenings => "Evenings 18:00-21:00",
            Preset::Weekends => "Weekends 10:00-16:00",
            Preset::Mixed => "Mixed",
            Preset::Empty => "Empty",
        }
    }

    pub fn from_code(code: &str) -> Option<Preset> {
        Preset::ALL.into_iter().find(|p| p.code() == code)
    }

    pub fn default_days(self) -> &'static [Weekday] {
        match self {
            Preset::Weekdays | Preset::Evenings | Preset::Mixed => &WEEKDAYS,
            Preset::Weekends => &[Weekday::Sat, Weekday::Sun],
            Preset::Empty => &[],
        }
    }

    pub fn info(self) -> PresetInfo {
        PresetInfo {
            code: self.code(),
            name: self.name(),
            slot_minutes: SLOT_GRANULARITY_MINUTES,
        }
    }
}

/// Cut `[start, end)` into back-to-back slots of `step_minutes` on each day,
/// dropping any slot that intersects a break. A trailing piece shorter than
/// a step is not emitted. Days are deduplicated and ordered from Sunday.
pub fn build_day_slots(
    days: &[Weekday],
    start: NaiveTime,
    end: NaiveTime,
    step_minutes: u32,
    breaks: &[(NaiveTime, NaiveTime)],
    note: Option<&str>,
) -> Vec<TemplateSlot> {
    let mut days = days.to_vec();
    days.sort_by_key(|d| d.num_days_from_sunday());
    days.dedup();

    let step = TimeDelta::minutes(i64::from(step_minutes));
    let mut out = Vec::new();
    if step_minutes == 0 {
        return out;
    }
    for day in days {
        let mut t = start;
        while t < end {
            let (next, wrapped) = t.overflowing_add_signed(step);
            if wrapped != 0 || next > end {
                break;
            }
            if !breaks.iter().any(|(from, to)| t < *to && *from < next) {
                out.push(TemplateSlot {
                    weekday: day,
                    start: t,
                    end: next,
                    note: note.map(str::to_owned),
                });
            }
            t = next;
        }
    }
    out
}

/// Expand a preset request into template entries. Pure; validation of the
/// resulting list happens in the template upsert.
pub(crate) fn expand_preset(req: &PresetRequest) -> Result<Vec<TemplateSlot>, SchedulerError> {
    let preset = Preset::from_code(&req.preset_code).ok_or_else(|| {
        SchedulerError::validation(format!("unknown preset '{}'", req.preset_code))
    })?;
    if req.end <= req.start {
        return Err(SchedulerError::validation("end must be after start"));
    }
    let step = match req.slot_minutes {
        0 => SLOT_GRANULARITY_MINUTES,
        m if m % SLOT_GRANULARITY_MINUTES == 0 => m,
        m => {
            return Err(SchedulerError::validation(format!(
                "slot length {m} is not a multiple of {SLOT_GRANULARITY_MINUTES} minutes"
            )));
        }
    };
    if let Some((from, to)) = req.breaks.iter().find(|(from, to)| to <= from) {
        return Err(SchedulerError::validation(format!(
            "break {from}-{to} ends before it starts"
        )));
    }

    let note = req.note.as_deref();
    let slots = match preset {
        Preset::Empty => Vec::new(),
        Preset::Mixed => {
            let mut slots = build_day_slots(
                &[Weekday::Mon, Weekday::Wed, Weekday::Fri],
                MIXED_MORNING.0,
                MIXED_MORNING.1,
                SLOT_GRANULARITY_MINUTES,
                &[],
                note,
            );
            slots.extend(build_day_slots(
                &[Weekday::Tue, Weekday::Thu],
                MIXED_AFTERNOON.0,
                MIXED_AFTERNOON.1,
                SLOT_GRANULARITY_MINUTES,
                &[],
                note,
            ));
            slots
        }
        _ => {
            let days = req.days.as_deref().unwrap_or(preset.default_days());
            build_day_slots(days, req.start, req.end, step, &req.breaks, note)
        }
    };
    Ok(slots)
}

impl Engine {
    /// Catalogue of preset codes, in display order.
    pub fn presets(&self) -> Vec<PresetInfo> {
        Preset::ALL.into_iter().map(Preset::info).collect()
    }

    /// Expand a preset and store the result as the specialist's template.
    pub async fn generate_from_preset(
        &self,
        specialist_id: Ulid,
        req: PresetRequest,
    ) -> Result<TemplateInfo, SchedulerError> {
        let started = Instant::now();
        let result = self.generate_from_preset_inner(specialist_id, req).await;
        record_op("generate_from_preset", started, &result);
        result
    }

    async fn generate_from_preset_inner(
        &self,
        specialist_id: Ulid,
        req: PresetRequest,
    ) -> Result<TemplateInfo, SchedulerError> {
        let slots = expand_preset(&req)?;
        tracing::debug!(
            specialist = %specialist_id,
            preset = %req.preset_code,
            slots = slots.len(),
            "expanded preset"
        );
        self.upsert_template(specialist_id, slots, req.is_active).await
    }
}
