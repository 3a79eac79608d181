use ulid::Ulid;

use crate::model::*;

use super::booking::{parent_details, specialist_details};
use super::conflict::validate_window;
use super::{Engine, SchedulerError};

fn filter_window(filter: &BookingFilter) -> Result<Option<Span>, SchedulerError> {
    filter
        .window
        .map(|(from, to)| validate_window(from, to))
        .transpose()
}

fn matches(booking: &Booking, filter: &BookingFilter, window: Option<&Span>) -> bool {
    filter.status.is_none_or(|s| booking.status == s)
        && window.is_none_or(|w| booking.span.overlaps(w))
}

/// Newest start first; ties broken by id so the order is stable.
fn newest_first(bookings: &mut [BookingInfo]) {
    bookings.sort_by(|a, b| b.start.cmp(&a.start).then(b.id.cmp(&a.id)));
}

impl Engine {
    /// Bookings on the specialist's calendar, newest start first.
    pub async fn specialist_bookings(
        &self,
        specialist_id: Ulid,
        filter: BookingFilter,
    ) -> Result<Vec<BookingInfo>, SchedulerError> {
        let window = filter_window(&filter)?;
        let Some(st) = self.read_specialist(&specialist_id).await else {
            return Ok(Vec::new());
        };
        let mut out: Vec<BookingInfo> = st
            .bookings
            .values()
            .filter(|b| matches(b, &filter, window.as_ref()))
            .map(BookingInfo::from)
            .collect();
        newest_first(&mut out);
        Ok(out)
    }

    /// Bookings a parent made, across all specialists, newest start first.
    pub async fn parent_bookings(
        &self,
        parent_id: Ulid,
        filter: BookingFilter,
    ) -> Result<Vec<BookingInfo>, SchedulerError> {
        let window = filter_window(&filter)?;
        let booking_ids = self.index.bookings_of_parent(&parent_id);

        // Group by specialist so each state is locked once.
        let mut by_specialist: Vec<(Ulid, Ulid)> = booking_ids
            .into_iter()
            .filter_map(|id| self.index.owner_of(&id).map(|sid| (sid, id)))
            .collect();
        by_specialist.sort_unstable();

        let mut out = Vec::new();
        for group in by_specialist.chunk_by(|a, b| a.0 == b.0) {
            let Some(st) = self.read_specialist(&group[0].0).await else {
                continue;
            };
            out.extend(
                group
                    .iter()
                    .filter_map(|(_, id)| st.bookings.get(id))
                    .filter(|b| b.parent_id == parent_id && matches(b, &filter, window.as_ref()))
                    .map(BookingInfo::from),
            );
        }
        newest_first(&mut out);
        Ok(out)
    }

    /// One booking as the specialist sees it, private notes included.
    pub async fn specialist_booking_details(
        &self,
        specialist_id: Ulid,
        booking_id: Ulid,
    ) -> Result<SpecialistBookingDetails, SchedulerError> {
        let booking = self.find_booking(booking_id).await?;
        if booking.specialist_id != specialist_id {
            return Err(SchedulerError::Forbidden(format!(
                "booking {booking_id} belongs to someone else"
            )));
        }
        Ok(specialist_details(&booking))
    }

    /// One booking as the parent sees it. Private notes never appear here.
    pub async fn parent_booking_details(
        &self,
        parent_id: Ulid,
        booking_id: Ulid,
    ) -> Result<ParentBookingDetails, SchedulerError> {
        let booking = self.find_booking(booking_id).await?;
        if booking.parent_id != parent_id {
            return Err(SchedulerError::Forbidden(format!(
                "booking {booking_id} belongs to someone else"
            )));
        }
        Ok(parent_details(&booking))
    }

    async fn find_booking(&self, booking_id: Ulid) -> Result<Booking, SchedulerError> {
        let not_found = || SchedulerError::not_found("booking", booking_id);
        let specialist_id = self.index.owner_of(&booking_id).ok_or_else(not_found)?;
        let st = self
            .read_specialist(&specialist_id)
            .await
            .ok_or_else(not_found)?;
        st.bookings.get(&booking_id).cloned().ok_or_else(not_found)
    }
}
