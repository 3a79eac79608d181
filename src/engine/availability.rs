use std::time::Instant;

use ulid::Ulid;

use crate::model::*;
use crate::observability::record_op;

use super::conflict::{check_no_overlap, validate_batch, validate_window};
use super::{Engine, SchedulerError};

impl Engine {
    /// Persist a batch of free slots for a specialist as one unit.
    ///
    /// The batch is rejected whole if any slot is malformed, misaligned, in the
    /// past, overlaps another requested slot, or overlaps a stored slot.
    pub async fn create_slots(
        &self,
        specialist_id: Ulid,
        batch: Vec<NewSlot>,
    ) -> Result<Vec<SlotInfo>, SchedulerError> {
        let started = Instant::now();
        let result = self.create_slots_inner(specialist_id, batch).await;
        record_op("create_slots", started, &result);
        result
    }

    async fn create_slots_inner(
        &self,
        specialist_id: Ulid,
        batch: Vec<NewSlot>,
    ) -> Result<Vec<SlotInfo>, SchedulerError> {
        let now = self.now();
        let checked = validate_batch(batch, now, self.policy.past_grace_ms)?;
        let spans: Vec<Span> = checked.iter().map(|(span, _)| *span).collect();

        let mut txn = self.begin(specialist_id).await;
        check_no_overlap(&txn, &spans)?;

        let slots: Vec<Slot> = checked
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
        let created: Vec<SlotInfo> = slots.iter().map(SlotInfo::from).collect();

        self.commit(
            &mut txn,
            Event::SlotsCreated {
                specialist_id,
                slots,
            },
        )
        .await?;
        Ok(created)
    }

    /// Slots intersecting `[from, to)`, ordered by start.
    pub async fn list_slots(
        &self,
        specialist_id: Ulid,
        from: Ms,
        to: Ms,
    ) -> Result<Vec<SlotInfo>, SchedulerError> {
        let window = validate_window(from, to)?;
        let Some(st) = self.read_specialist(&specialist_id).await else {
            return Ok(Vec::new());
        };
        Ok(st.overlapping(&window).map(SlotInfo::from).collect())
    }

    /// Unoccupied slots of an approved specialist, for the public catalogue.
    /// An unapproved specialist looks the same as an unknown one.
    pub async fn list_free_slots(
        &self,
        specialist_id: Ulid,
        from: Ms,
        to: Ms,
    ) -> Result<Vec<SlotInfo>, SchedulerError> {
        let window = validate_window(from, to)?;
        if !self.directory.is_specialist_approved(specialist_id).await {
            return Err(SchedulerError::not_found("specialist", specialist_id));
        }
        let Some(st) = self.read_specialist(&specialist_id).await else {
            return Ok(Vec::new());
        };
        Ok(st
            .overlapping(&window)
            .filter(|s| !s.occupied)
            .map(SlotInfo::from)
            .collect())
    }

    /// Remove a free slot. Bookings that still point at it keep their span
    /// and lose the reference.
    pub async fn delete_slot(&self, specialist_id: Ulid, slot_id: Ulid) -> Result<(), SchedulerError> {
        let started = Instant::now();
        let result = self.delete_slot_inner(specialist_id, slot_id).await;
        record_op("delete_slot", started, &result);
        result
    }

    async fn delete_slot_inner(&self, specialist_id: Ulid, slot_id: Ulid) -> Result<(), SchedulerError> {
        let mut txn = self.begin_for("slot", slot_id).await?;
        if txn.specialist_id != specialist_id {
            return Err(SchedulerError::Forbidden(format!(
                "slot {slot_id} belongs to another specialist"
            )));
        }
        let slot = txn
            .slot(slot_id)
            .ok_or(SchedulerError::not_found("slot", slot_id))?;
        if slot.occupied {
            return Err(SchedulerError::conflict(format!(
                "slot {slot_id} is booked and cannot be deleted"
            )));
        }
        self.commit(
            &mut txn,
            Event::SlotDeleted {
                id: slot_id,
                specialist_id,
            },
        )
        .await
    }

    /// Compare-and-set `occupied: false → true`. `Ok(false)` if the slot is
    /// missing or someone else already holds it.
    pub async fn try_occupy(&self, slot_id: Ulid) -> Result<bool, SchedulerError> {
        let Ok(mut txn) = self.begin_for("slot", slot_id).await else {
            return Ok(false);
        };
        match txn.slot(slot_id) {
            Some(slot) if !slot.occupied => {}
            _ => {
                metrics::counter!(crate::observability::OCCUPANCY_CONFLICTS_TOTAL).increment(1);
                return Ok(false);
            }
        }
        let specialist_id = txn.specialist_id;
        let at = self.now();
        self.commit(
            &mut txn,
            Event::SlotOccupied {
                id: slot_id,
                specialist_id,
                at,
            },
        )
        .await?;
        Ok(true)
    }

    /// Compare-and-set `occupied: true → false`, only while the slot's start
    /// is still ahead of now. `Ok(false)` otherwise.
    pub async fn release(&self, slot_id: Ulid) -> Result<bool, SchedulerError> {
        let Ok(mut txn) = self.begin_for("slot", slot_id).await else {
            return Ok(false);
        };
        let at = self.now();
        match txn.slot(slot_id) {
            Some(slot) if slot.occupied && slot.span.start > at => {}
            _ => return Ok(false),
        }
        let specialist_id = txn.specialist_id;
        self.commit(
            &mut txn,
            Event::SlotReleased {
                id: slot_id,
                specialist_id,
                at,
            },
        )
        .await?;
        Ok(true)
    }
}
