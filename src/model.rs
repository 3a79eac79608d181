use std::collections::HashMap;
use std::fmt;

use chrono::{NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, UTC. The only instant type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        crate::engine::interval::overlaps(self.start, self.end, other.start, other.end)
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// One bookable interval of one specialist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub specialist_id: Ulid,
    pub span: Span,
    pub occupied: bool,
    pub note: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Slot {
    /// free → occupied. Returns false (and changes nothing) if already occupied.
    pub(crate) fn occupy(&mut self, at: Ms) -> bool {
        if self.occupied {
            return false;
        }
        self.occupied = true;
        self.updated_at = at;
        true
    }

    /// occupied → free. Returns false (and changes nothing) if already free.
    pub(crate) fn release(&mut self, at: Ms) -> bool {
        if !self.occupied {
            return false;
        }
        self.occupied = false;
        self.updated_at = at;
        true
    }
}

/// One recurring entry of a weekly template, in the specialist's local wall time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateSlot {
    pub weekday: Weekday,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub note: Option<String>,
}

impl TemplateSlot {
    pub fn new(weekday: Weekday, start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            weekday,
            start,
            end,
            note: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// Sort key: weekday counted from Sunday = 0, then start time.
    pub fn sort_key(&self) -> (u32, NaiveTime) {
        (self.weekday.num_days_from_sunday(), self.start)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyTemplate {
    pub id: Ulid,
    pub specialist_id: Ulid,
    pub is_active: bool,
    /// Sorted by `TemplateSlot::sort_key`.
    pub slots: Vec<TemplateSlot>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Declined,
    CancelledByParent,
    CancelledBySpecialist,
    Completed,
}

impl BookingStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    /// Cancelled or declined; cancelling again is a no-op.
    pub fn is_withdrawn(self) -> bool {
        matches!(
            self,
            BookingStatus::Declined
                | BookingStatus::CancelledByParent
                | BookingStatus::CancelledBySpecialist
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Declined => "declined",
            BookingStatus::CancelledByParent => "cancelled_by_parent",
            BookingStatus::CancelledBySpecialist => "cancelled_by_specialist",
            BookingStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session report written by the specialist on completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub summary: String,
    pub recommendations: Option<String>,
    pub next_steps: Option<String>,
    /// Specialist-only. Never leaves the engine on the parent read path.
    pub private_notes: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub parent_acknowledged_at: Option<Ms>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub specialist_id: Ulid,
    pub parent_id: Ulid,
    pub child_id: Option<Ulid>,
    /// Copied from the slot at creation; never changes afterwards.
    pub span: Span,
    pub status: BookingStatus,
    /// Originating slot, `None` once that slot has been removed.
    pub slot_id: Option<Ulid>,
    pub message: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub outcome: Option<Outcome>,
}

impl Booking {
    /// Forget the originating slot. The span stays as booked.
    pub fn detach_slot(&mut self) {
        self.slot_id = None;
    }
}

/// Everything the engine owns for one specialist.
#[derive(Debug, Clone)]
pub struct SpecialistState {
    pub id: Ulid,
    /// Non-overlapping, sorted by `span.start`.
    pub slots: Vec<Slot>,
    pub template: Option<WeeklyTemplate>,
    pub bookings: HashMap<Ulid, Booking>,
}

impl SpecialistState {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            slots: Vec::new(),
            template: None,
            bookings: HashMap::new(),
        }
    }

    /// Insert slot maintaining sort order by span.start.
    pub fn insert_slot(&mut self, slot: Slot) {
        let pos = self
            .slots
            .binary_search_by_key(&slot.span.start, |s| s.span.start)
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, slot);
    }

    /// Remove a slot and detach every booking that still points at it.
    pub fn remove_slot(&mut self, id: Ulid) -> Option<Slot> {
        let pos = self.slots.iter().position(|s| s.id == id)?;
        for booking in self.bookings.values_mut() {
            if booking.slot_id == Some(id) {
                booking.detach_slot();
            }
        }
        Some(self.slots.remove(pos))
    }

    pub fn slot(&self, id: Ulid) -> Option<&Slot> {
        self.slots.iter().find(|s| s.id == id)
    }

    pub fn slot_mut(&mut self, id: Ulid) -> Option<&mut Slot> {
        self.slots.iter_mut().find(|s| s.id == id)
    }

    /// Return only slots whose span intersects the query window.
    /// Slots never overlap, so ends are sorted too and the prefix cut is exact.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Slot> {
        let right_bound = self.slots.partition_point(|s| s.span.start < query.end);
        self.slots[..right_bound]
            .iter()
            .filter(move |s| s.span.end > query.start)
    }
}

/// One per committed transaction. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SlotsCreated {
        specialist_id: Ulid,
        slots: Vec<Slot>,
    },
    SlotDeleted {
        id: Ulid,
        specialist_id: Ulid,
    },
    SlotOccupied {
        id: Ulid,
        specialist_id: Ulid,
        at: Ms,
    },
    SlotReleased {
        id: Ulid,
        specialist_id: Ulid,
        at: Ms,
    },
    TemplateReplaced {
        template: WeeklyTemplate,
    },
    TemplateMaterialized {
        specialist_id: Ulid,
        purged: Vec<Ulid>,
        slots: Vec<Slot>,
    },
    /// Occupies `booking.slot_id` and inserts the booking, as one unit.
    BookingCreated {
        booking: Booking,
    },
    BookingTransitioned {
        id: Ulid,
        specialist_id: Ulid,
        to: BookingStatus,
        released_slot: Option<Ulid>,
        at: Ms,
    },
    BookingCompleted {
        id: Ulid,
        specialist_id: Ulid,
        outcome: Outcome,
        at: Ms,
    },
    OutcomeAcknowledged {
        id: Ulid,
        specialist_id: Ulid,
        at: Ms,
    },
    /// Compaction only: reinstate a booking without touching slot occupancy.
    BookingRestored {
        booking: Booking,
    },
}

impl Event {
    pub fn specialist_id(&self) -> Ulid {
        match self {
            Event::SlotsCreated { specialist_id, .. }
            | Event::SlotDeleted { specialist_id, .. }
            | Event::SlotOccupied { specialist_id, .. }
            | Event::SlotReleased { specialist_id, .. }
            | Event::TemplateMaterialized { specialist_id, .. }
            | Event::BookingTransitioned { specialist_id, .. }
            | Event::BookingCompleted { specialist_id, .. }
            | Event::OutcomeAcknowledged { specialist_id, .. } => *specialist_id,
            Event::TemplateReplaced { template } => template.specialist_id,
            Event::BookingCreated { booking } | Event::BookingRestored { booking } => {
                booking.specialist_id
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::SlotsCreated { .. } => "slots_created",
            Event::SlotDeleted { .. } => "slot_deleted",
            Event::SlotOccupied { .. } => "slot_occupied",
            Event::SlotReleased { .. } => "slot_released",
            Event::TemplateReplaced { .. } => "template_replaced",
            Event::TemplateMaterialized { .. } => "template_materialized",
            Event::BookingCreated { .. } => "booking_created",
            Event::BookingTransitioned { .. } => "booking_transitioned",
            Event::BookingCompleted { .. } => "booking_completed",
            Event::OutcomeAcknowledged { .. } => "outcome_acknowledged",
            Event::BookingRestored { .. } => "booking_restored",
        }
    }
}

// ── Inputs ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSlot {
    pub start: Ms,
    pub end: Ms,
    pub note: Option<String>,
}

impl NewSlot {
    pub fn new(start: Ms, end: Ms) -> Self {
        Self {
            start,
            end,
            note: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateBooking {
    pub slot_id: Ulid,
    pub child_id: Option<Ulid>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CloseBooking {
    pub summary: String,
    pub recommendations: Option<String>,
    pub next_steps: Option<String>,
    pub private_notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BookingFilter {
    pub status: Option<BookingStatus>,
    /// `[from, to)`; bookings overlapping it are kept.
    pub window: Option<(Ms, Ms)>,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub id: Ulid,
    pub specialist_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub occupied: bool,
    pub note: Option<String>,
}

impl From<&Slot> for SlotInfo {
    fn from(slot: &Slot) -> Self {
        Self {
            id: slot.id,
            specialist_id: slot.specialist_id,
            start: slot.span.start,
            end: slot.span.end,
            occupied: slot.occupied,
            note: slot.note.clone(),
        }
    }
}

/// `id` is `None` when the specialist has never saved a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateInfo {
    pub id: Option<Ulid>,
    pub is_active: bool,
    pub slots: Vec<TemplateSlot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInfo {
    pub id: Ulid,
    pub specialist_id: Ulid,
    pub parent_id: Ulid,
    pub child_id: Option<Ulid>,
    pub start: Ms,
    pub end: Ms,
    pub status: BookingStatus,
    pub slot_id: Option<Ulid>,
    pub message: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl From<&Booking> for BookingInfo {
    fn from(b: &Booking) -> Self {
        Self {
            id: b.id,
            specialist_id: b.specialist_id,
            parent_id: b.parent_id,
            child_id: b.child_id,
            start: b.span.start,
            end: b.span.end,
            status: b.status,
            slot_id: b.slot_id,
            message: b.message.clone(),
            created_at: b.created_at,
            updated_at: b.updated_at,
        }
    }
}

/// The part of an outcome both parties may read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeInfo {
    pub summary: String,
    pub recommendations: Option<String>,
    pub next_steps: Option<String>,
    pub created_at: Ms,
    pub parent_acknowledged_at: Option<Ms>,
}

impl From<&Outcome> for OutcomeInfo {
    fn from(o: &Outcome) -> Self {
        Self {
            summary: o.summary.clone(),
            recommendations: o.recommendations.clone(),
            next_steps: o.next_steps.clone(),
            created_at: o.created_at,
            parent_acknowledged_at: o.parent_acknowledged_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentBookingDetails {
    pub booking: BookingInfo,
    pub outcome: Option<OutcomeInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecialistBookingDetails {
    pub booking: BookingInfo,
    pub outcome: Option<OutcomeInfo>,
    pub private_notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializeReport {
    pub created: usize,
    pub purged: usize,
    pub from: NaiveDate,
    pub to: NaiveDate,
}
