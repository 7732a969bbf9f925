use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::availability::generator::Slot;
use crate::booking::engine::BookingEngine;
use crate::booking::model::{Booking, BookingId, BookingStatus};
use crate::booking::repository::BookingRepository;
use crate::calendar::{CalendarApi, CalendarEvent, EventPatch, list_events_for};
use crate::error::{RescheduleError, SyncError};
use crate::locks::KeyedLocks;
use crate::logger::warn_if_slow;
use crate::metrics::counters::{Counters, bump};
use crate::sync::board::Board;
use crate::sync::tags::{
    OwnerTag, color_from_status, embed_tag, extract_tag, status_from_color, title_for_status,
};
use crate::time::Clock;

const CALENDAR_BUDGET: Duration = Duration::from_millis(1500);

/// Both halves of a completed reschedule.
#[derive(Clone, Debug, PartialEq)]
pub struct Rescheduled {
    pub original_id: BookingId,
    pub new_booking: Booking,
}

/// Moves bookings between statuses by writing the calendar event first and
/// the local mirror second. Writes for one booking are serialized so a
/// caller's transitions land in the order issued.
pub struct StatusSynchronizer {
    calendar: Arc<dyn CalendarApi>,
    repo: Arc<dyn BookingRepository>,
    engine: Arc<BookingEngine>,
    clock: Arc<dyn Clock>,
    counters: Counters,
    locks: KeyedLocks<Uuid>,
}

impl StatusSynchronizer {
    pub fn new(
        calendar: Arc<dyn CalendarApi>,
        repo: Arc<dyn BookingRepository>,
        engine: Arc<BookingEngine>,
        clock: Arc<dyn Clock>,
        counters: Counters,
    ) -> Self {
        Self {
            calendar,
            repo,
            engine,
            clock,
            counters,
            locks: KeyedLocks::new(),
        }
    }

    /// Sets a simple status. `rescheduled` is only reachable through
    /// `reschedule`.
    #[instrument(skip(self), target = "sync", fields(booking_id = %booking_id, status = %status))]
    pub async fn set_status(
        &self,
        booking_id: Uuid,
        status: BookingStatus,
    ) -> Result<CalendarEvent, SyncError> {
        let _g = self.locks.lock(booking_id).await;
        let booking = self.load(booking_id).await?;
        if status == BookingStatus::Rescheduled {
            return Err(SyncError::InvalidTransition {
                from: booking.status,
                to: status,
            });
        }
        self.write_status(&booking, status, None).await
    }

    /// Re-reads the event and adopts the status a human left on it.
    #[instrument(skip(self), target = "sync", fields(booking_id = %booking_id))]
    pub async fn pull_status(&self, booking_id: Uuid) -> Result<Booking, SyncError> {
        let _g = self.locks.lock(booking_id).await;
        let mut booking = self.load(booking_id).await?;
        let event = self.read_event(&booking).await?;

        let observed = status_from_color(event.color, &event.title);
        if observed == booking.status {
            return Ok(booking);
        }
        if !booking.status.can_transition_to(observed) {
            warn!(local = %booking.status, calendar = %observed, "calendar status conflicts with local state; left as is");
            return Err(SyncError::InvalidTransition {
                from: booking.status,
                to: observed,
            });
        }

        let now_ms = self.clock.now().timestamp_millis();
        self.repo
            .update_status(&booking.booking_id, observed, None, now_ms)
            .await
            .map_err(SyncError::Storage)?;
        info!(from = %booking.status, to = %observed, "status pulled from calendar");

        booking.status = observed;
        booking.updated_ms = now_ms;
        Ok(booking)
    }

    /// Moves a pending booking to `new_slot`: books the replacement under the
    /// original owner tag, then marks the original `rescheduled`. If the
    /// second step fails the original event gets its color and title back,
    /// the replacement is cancelled again, and the error says whether both
    /// undo steps worked.
    #[instrument(skip(self, note), target = "sync", fields(booking_id = %booking_id, new_staff = %new_slot.staff_id))]
    pub async fn reschedule(
        &self,
        booking_id: Uuid,
        new_slot: &Slot,
        note: Option<&str>,
    ) -> Result<Rescheduled, RescheduleError> {
        let _g = self.locks.lock(booking_id).await;

        let original = match self.load(booking_id).await {
            Ok(b) => b,
            Err(SyncError::BookingNotFound(id)) => return Err(RescheduleError::BookingNotFound(id)),
            Err(SyncError::Storage(e)) => return Err(RescheduleError::Storage(e)),
            Err(other) => return Err(RescheduleError::Storage(other.into())),
        };
        if original.status != BookingStatus::Pending {
            return Err(RescheduleError::NotPending(original.status));
        }

        let event = self.calendar
            .get_event(&original.event.calendar_id, &original.event.event_id)
            .await?;
        let tag = extract_tag(&event.description)
            .or_else(|| OwnerTag::for_owner(&original.owner_id))
            .ok_or_else(|| RescheduleError::Storage(anyhow::anyhow!("booking has no usable owner id")))?;

        let new_booking = self
            .engine
            .book_tagged(new_slot, original.customer.clone(), &tag, note)
            .await
            .map_err(RescheduleError::NewBookingFailed)?;

        if let Err(source) = self
            .write_status(&original, BookingStatus::Rescheduled, Some(new_booking.booking_id))
            .await
        {
            error!(error = %source, new_booking_id = %new_booking.booking_id, "original not marked rescheduled; compensating");
            // the calendar write may have landed before the failure
            let restored = self.restore_event(&original, &event).await;
            let cancelled = self
                .write_status(&new_booking, BookingStatus::Cancelled, None)
                .await
                .map_err(|e| error!(error = %e, "cancelling the replacement failed"))
                .is_ok();
            bump(&self.counters.reschedule_compensations);

            return Err(RescheduleError::OriginalNotUpdated {
                new_booking_id: new_booking.booking_id,
                compensated: restored && cancelled,
                source,
            });
        }

        bump(&self.counters.reschedules);
        info!(new_booking_id = %new_booking.booking_id, "booking rescheduled");
        Ok(Rescheduled {
            original_id: original.booking_id,
            new_booking,
        })
    }

    /// Status transition used by the outcome tracker, which already knows
    /// the booking.
    pub(crate) async fn apply_status(
        &self,
        booking_id: Uuid,
        status: BookingStatus,
    ) -> Result<CalendarEvent, SyncError> {
        let _g = self.locks.lock(booking_id).await;
        let booking = self.load(booking_id).await?;
        self.write_status(&booking, status, None).await
    }

    /// An owner's bookings in `[from, to)` grouped by the status their events
    /// currently show.
    #[instrument(skip(self), target = "sync")]
    pub async fn board(
        &self,
        owner_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Board, SyncError> {
        let bookings = self
            .repo
            .fetch_by_owner_in_range(owner_id, from.timestamp_millis(), to.timestamp_millis())
            .await
            .map_err(SyncError::Storage)?;

        let mut calendars: Vec<String> = bookings.iter().map(|b| b.event.calendar_id.clone()).collect();
        calendars.sort();
        calendars.dedup();

        let events = warn_if_slow(
            "calendar_list_for_board",
            CALENDAR_BUDGET,
            list_events_for(self.calendar.as_ref(), &calendars, from, to),
        )
        .await?;

        Ok(Board::build(owner_id, &bookings, &events))
    }

    /// Puts the color and title of `before` back on the booking's event.
    async fn restore_event(&self, booking: &Booking, before: &CalendarEvent) -> bool {
        let patch = EventPatch {
            title: Some(before.title.clone()),
            description: None,
            color: Some(before.color),
        };
        warn_if_slow(
            "calendar_update_event",
            CALENDAR_BUDGET,
            self.calendar
                .update_event(&booking.event.calendar_id, &booking.event.event_id, &patch),
        )
        .await
        .map_err(|e| {
            bump(&self.counters.calendar_failures);
            error!(error = %e, event_id = %booking.event.event_id, "restoring the original event failed");
        })
        .is_ok()
    }

    async fn load(&self, booking_id: Uuid) -> Result<Booking, SyncError> {
        self.repo
            .fetch_by_id(&booking_id)
            .await
            .map_err(SyncError::Storage)?
            .ok_or(SyncError::BookingNotFound(booking_id))
    }

    async fn read_event(&self, booking: &Booking) -> Result<CalendarEvent, SyncError> {
        let event = warn_if_slow(
            "calendar_get_event",
            CALENDAR_BUDGET,
            self.calendar
                .get_event(&booking.event.calendar_id, &booking.event.event_id),
        )
        .await?;
        Ok(event)
    }

    /// Reads the event, writes color and title for `status` while keeping
    /// (or restoring) the owner tag, then updates the local record.
    async fn write_status(
        &self,
        booking: &Booking,
        status: BookingStatus,
        rescheduled_to: Option<Uuid>,
    ) -> Result<CalendarEvent, SyncError> {
        if !booking.status.can_transition_to(status) {
            return Err(SyncError::InvalidTransition {
                from: booking.status,
                to: status,
            });
        }

        let mut event = self.read_event(booking).await?;

        let mut patch = EventPatch {
            color: Some(color_from_status(status)),
            ..EventPatch::default()
        };
        let title = title_for_status(&event.title, status);
        if title != event.title {
            patch.title = Some(title);
        }
        if extract_tag(&event.description).is_none() {
            if let Some(tag) = OwnerTag::for_owner(&booking.owner_id) {
                warn!(event_id = %event.id, "owner tag missing from event; restoring");
                patch.description = Some(embed_tag(&event.description, &tag));
            }
        }

        warn_if_slow(
            "calendar_update_event",
            CALENDAR_BUDGET,
            self.calendar
                .update_event(&booking.event.calendar_id, &booking.event.event_id, &patch),
        )
        .await
        .inspect_err(|_| bump(&self.counters.calendar_failures))?;
        event.apply(&patch);

        self.repo
            .update_status(
                &booking.booking_id,
                status,
                rescheduled_to,
                self.clock.now().timestamp_millis(),
            )
            .await
            .map_err(SyncError::Storage)?;

        bump(&self.counters.status_writes);
        info!(booking_id = %booking.booking_id, from = %booking.status, to = %status, "status written");
        Ok(event)
    }
}
