use std::time::Instant;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::record_op;

use super::conflict::validate_text;
use super::{Engine, SchedulerError, Txn};

/// Who is acting on a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Actor {
    Parent(Ulid),
    Specialist(Ulid),
}

fn ensure_party(txn: &Txn, booking_id: Ulid, actor: Actor) -> Result<&Booking, SchedulerError> {
    let booking = txn
        .bookings
        .get(&booking_id)
        .ok_or(SchedulerError::not_found("booking", booking_id))?;
    let allowed = match actor {
        Actor::Parent(id) => booking.parent_id == id,
        Actor::Specialist(id) => booking.specialist_id == id,
    };
    if !allowed {
        return Err(SchedulerError::Forbidden(format!(
            "booking {booking_id} belongs to someone else"
        )));
    }
    Ok(booking)
}

impl Engine {
    /// Claim a free slot for a parent. Exactly one of any number of
    /// concurrent calls on the same slot succeeds; the rest get `Conflict`.
    pub async fn create_booking(
        &self,
        parent_id: Ulid,
        req: CreateBooking,
    ) -> Result<BookingInfo, SchedulerError> {
        let started = Instant::now();
        let result = self.create_booking_inner(parent_id, req).await;
        record_op("create_booking", started, &result);
        result
    }

    async fn create_booking_inner(
        &self,
        parent_id: Ulid,
        req: CreateBooking,
    ) -> Result<BookingInfo, SchedulerError> {
        validate_text("message", req.message.as_deref(), MAX_MESSAGE_LEN)?;

        let specialist_id = self
            .index
            .owner_of(&req.slot_id)
            .ok_or(SchedulerError::not_found("slot", req.slot_id))?;
        if !self.directory.is_specialist_approved(specialist_id).await {
            return Err(SchedulerError::validation("specialist is not accepting bookings"));
        }
        // Checked again under the write lock below; this read only fixes the
        // order in which a request learns what is wrong with it.
        let start = match self.read_specialist(&specialist_id).await {
            Some(st) => st.slot(req.slot_id).map(|slot| slot.span.start),
            None => None,
        }
        .ok_or(SchedulerError::not_found("slot", req.slot_id))?;
        if start < self.now() {
            return Err(SchedulerError::validation("slot has already started"));
        }
        match req.child_id {
            Some(child_id) => {
                if !self.directory.is_child_of(child_id, parent_id).await {
                    return Err(SchedulerError::Forbidden(format!(
                        "child {child_id} does not belong to the parent"
                    )));
                }
            }
            None if self.policy.require_child => {
                return Err(SchedulerError::validation("a child must be selected"));
            }
            None => {}
        }

        let mut txn = self.begin(specialist_id).await;
        let now = self.now();
        let slot = txn
            .slot(req.slot_id)
            .ok_or(SchedulerError::not_found("slot", req.slot_id))?;
        if slot.span.start < now {
            return Err(SchedulerError::validation("slot has already started"));
        }
        if slot.occupied {
            metrics::counter!(crate::observability::OCCUPANCY_CONFLICTS_TOTAL).increment(1);
            tracing::warn!(slot = %req.slot_id, parent = %parent_id, "lost race for slot");
            return Err(SchedulerError::conflict("slot already booked"));
        }

        let booking = Booking {
            id: Ulid::new(),
            specialist_id,
            parent_id,
            child_id: req.child_id,
            span: slot.span,
            status: BookingStatus::Pending,
            slot_id: Some(req.slot_id),
            message: req.message,
            created_at: now,
            updated_at: now,
            outcome: None,
        };
        let info = BookingInfo::from(&booking);
        self.commit(&mut txn, Event::BookingCreated { booking }).await?;
        Ok(info)
    }

    /// Specialist accepts a pending request.
    pub async fn confirm_booking(
        &self,
        specialist_id: Ulid,
        booking_id: Ulid,
    ) -> Result<BookingInfo, SchedulerError> {
        let started = Instant::now();
        let result = self
            .transition(
                Actor::Specialist(specialist_id),
                booking_id,
                "confirm",
                BookingStatus::Confirmed,
                &[BookingStatus::Pending],
            )
            .await;
        record_op("confirm_booking", started, &result);
        result
    }

    /// Specialist turns down a pending request. Frees the slot if it hasn't started.
    pub async fn decline_booking(
        &self,
        specialist_id: Ulid,
        booking_id: Ulid,
    ) -> Result<BookingInfo, SchedulerError> {
        let started = Instant::now();
        let result = self
            .transition(
                Actor::Specialist(specialist_id),
                booking_id,
                "decline",
                BookingStatus::Declined,
                &[BookingStatus::Pending],
            )
            .await;
        record_op("decline_booking", started, &result);
        result
    }

    /// Parent withdraws a pending or confirmed booking. Cancelling an already
    /// withdrawn booking succeeds without changing anything.
    pub async fn cancel_booking(
        &self,
        parent_id: Ulid,
        booking_id: Ulid,
    ) -> Result<BookingInfo, SchedulerError> {
        let started = Instant::now();
        let result = self
            .transition(
                Actor::Parent(parent_id),
                booking_id,
                "cancel",
                BookingStatus::CancelledByParent,
                &[BookingStatus::Pending, BookingStatus::Confirmed],
            )
            .await;
        record_op("cancel_booking", started, &result);
        result
    }

    /// Specialist withdraws a pending or confirmed booking. Same rules as
    /// [`Engine::cancel_booking`].
    pub async fn cancel_booking_by_specialist(
        &self,
        specialist_id: Ulid,
        booking_id: Ulid,
    ) -> Result<BookingInfo, SchedulerError> {
        let started = Instant::now();
        let result = self
            .transition(
                Actor::Specialist(specialist_id),
                booking_id,
                "cancel",
                BookingStatus::CancelledBySpecialist,
                &[BookingStatus::Pending, BookingStatus::Confirmed],
            )
            .await;
        record_op("cancel_booking_by_specialist", started, &result);
        result
    }

    /// Shared status move. Withdrawals (`to` is cancelled or declined) release
    /// the slot when it still starts in the future, and are idempotent for
    /// cancels: an already withdrawn booking is returned as is.
    async fn transition(
        &self,
        actor: Actor,
        booking_id: Ulid,
        action: &'static str,
        to: BookingStatus,
        from: &[BookingStatus],
    ) -> Result<BookingInfo, SchedulerError> {
        let mut txn = self.begin_for("booking", booking_id).await?;
        let booking = ensure_party(&txn, booking_id, actor)?;

        let is_cancel = matches!(
            to,
            BookingStatus::CancelledByParent | BookingStatus::CancelledBySpecialist
        );
        if is_cancel && booking.status.is_withdrawn() {
            return Ok(BookingInfo::from(booking));
        }
        if !from.contains(&booking.status) {
            return Err(SchedulerError::InvalidTransition {
                booking: booking_id,
                from: booking.status,
                action,
            });
        }

        let at = self.now();
        let released_slot = if to.is_withdrawn() && booking.span.start > at {
            booking
                .slot_id
                .filter(|id| txn.slot(*id).is_some_and(|s| s.occupied))
        } else {
            None
        };
        let specialist_id = txn.specialist_id;
        self.commit(
            &mut txn,
            Event::BookingTransitioned {
                id: booking_id,
                specialist_id,
                to,
                released_slot,
                at,
            },
        )
        .await?;
        tracing::debug!(booking = %booking_id, status = %to, released = released_slot.is_some(), "booking moved");
        Ok(BookingInfo::from(&txn.bookings[&booking_id]))
    }

    /// Specialist closes a confirmed session with its report.
    pub async fn complete_booking(
        &self,
        specialist_id: Ulid,
        booking_id: Ulid,
        report: CloseBooking,
    ) -> Result<SpecialistBookingDetails, SchedulerError> {
        let started = Instant::now();
        let result = self.complete_booking_inner(specialist_id, booking_id, report).await;
        record_op("complete_booking", started, &result);
        result
    }

    async fn complete_booking_inner(
        &self,
        specialist_id: Ulid,
        booking_id: Ulid,
        report: CloseBooking,
    ) -> Result<SpecialistBookingDetails, SchedulerError> {
        let summary = report.summary.trim();
        if summary.is_empty() {
            return Err(SchedulerError::validation("summary is required"));
        }
        validate_text("summary", Some(summary), MAX_SUMMARY_LEN)?;
        validate_text("recommendations", report.recommendations.as_deref(), MAX_SUMMARY_LEN)?;
        validate_text("next steps", report.next_steps.as_deref(), MAX_NEXT_STEPS_LEN)?;
        validate_text("private notes", report.private_notes.as_deref(), MAX_SUMMARY_LEN)?;

        let mut txn = self.begin_for("booking", booking_id).await?;
        let booking = ensure_party(&txn, booking_id, Actor::Specialist(specialist_id))?;
        if booking.status != BookingStatus::Confirmed {
            return Err(SchedulerError::InvalidTransition {
                booking: booking_id,
                from: booking.status,
                action: "complete",
            });
        }

        let at = self.now();
        let created_at = booking.outcome.as_ref().map_or(at, |o| o.created_at);
        let outcome = Outcome {
            summary: summary.to_owned(),
            recommendations: report.recommendations,
            next_steps: report.next_steps,
            private_notes: report.private_notes,
            created_at,
            updated_at: at,
            parent_acknowledged_at: None,
        };
        self.commit(
            &mut txn,
            Event::BookingCompleted {
                id: booking_id,
                specialist_id,
                outcome,
                at,
            },
        )
        .await?;
        Ok(specialist_details(&txn.bookings[&booking_id]))
    }

    /// Parent marks the session report as read. Only the first call is recorded.
    pub async fn acknowledge_outcome(
        &self,
        parent_id: Ulid,
        booking_id: Ulid,
    ) -> Result<ParentBookingDetails, SchedulerError> {
        let started = Instant::now();
        let result = self.acknowledge_outcome_inner(parent_id, booking_id).await;
        record_op("acknowledge_outcome", started, &result);
        result
    }

    async fn acknowledge_outcome_inner(
        &self,
        parent_id: Ulid,
        booking_id: Ulid,
    ) -> Result<ParentBookingDetails, SchedulerError> {
        let mut txn = self.begin_for("booking", booking_id).await?;
        let booking = ensure_party(&txn, booking_id, Actor::Parent(parent_id))?;
        let Some(outcome) = &booking.outcome else {
            return Err(SchedulerError::validation("booking has no outcome yet"));
        };
        if outcome.parent_acknowledged_at.is_none() {
            let specialist_id = txn.specialist_id;
            let at = self.now();
            self.commit(
                &mut txn,
                Event::OutcomeAcknowledged {
                    id: booking_id,
                    specialist_id,
                    at,
                },
            )
            .await?;
        }
        Ok(parent_details(&txn.bookings[&booking_id]))
    }
}

pub(super) fn parent_details(booking: &Booking) -> ParentBookingDetails {
    ParentBookingDetails {
        booking: BookingInfo::from(booking),
        outcome: booking.outcome.as_ref().map(OutcomeInfo::from),
    }
}

pub(super) fn specialist_details(booking: &Booking) -> SpecialistBookingDetails {
    SpecialistBookingDetails {
        booking: BookingInfo::from(booking),
        outcome: booking.outcome.as_ref().map(OutcomeInfo::from),
        private_notes: booking.outcome.as_ref().and_then(|o| o.private_notes.clone()),
    }
}
