use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use tracing::{debug, info, instrument, warn};

use crate::booking::model::{Booking, BookingOutcome, BookingStatus, OutcomeKind};
use crate::booking::repository::BookingRepository;
use crate::calendar::{CalendarApi, CalendarError};
use crate::error::{OutcomeError, SyncError};
use crate::metrics::counters::{Counters, bump};
use crate::sync::synchronizer::StatusSynchronizer;
use crate::sync::tags::status_from_color;
use crate::time::{Clock, end_of_day, local_date, start_of_day};

/// Why a booking was left for a later scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Deferral {
    /// Still pending and its end-of-day deadline has not passed.
    AwaitingDeadline,
    /// The calendar could not be read or written.
    CalendarUnavailable(String),
    /// Local storage failed for this booking.
    Storage(String),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScanReport {
    pub date: Option<NaiveDate>,
    /// Outcomes written by this scan. Outcomes already on record are not
    /// repeated.
    pub outcomes: Vec<BookingOutcome>,
    pub deferred: Vec<(uuid::Uuid, Deferral)>,
}

/// Settles past bookings into terminal outcomes.
pub struct OutcomeTracker {
    calendar: Arc<dyn CalendarApi>,
    repo: Arc<dyn BookingRepository>,
    sync: Arc<StatusSynchronizer>,
    clock: Arc<dyn Clock>,
    timezone: Tz,
    /// Time after the end of a booking's local day before an unmarked booking
    /// counts as a no-show.
    no_show_grace: Duration,
    counters: Counters,
}

/// What the calendar says about one booking.
enum Verdict {
    Settled(OutcomeKind, BookingStatus),
    Deferred(Deferral),
    /// Superseded by a reschedule; no outcome of its own.
    Skip,
}

impl OutcomeTracker {
    pub fn new(
        calendar: Arc<dyn CalendarApi>,
        repo: Arc<dyn BookingRepository>,
        sync: Arc<StatusSynchronizer>,
        clock: Arc<dyn Clock>,
        timezone: Tz,
        no_show_grace: Duration,
        counters: Counters,
    ) -> Self {
        Self {
            calendar,
            repo,
            sync,
            clock,
            timezone,
            no_show_grace,
            counters,
        }
    }

    /// Records an outcome for every booking on local `date` that has started
    /// and has none yet. Safe to re-run: existing outcomes are left alone.
    #[instrument(skip(self), target = "outcome", fields(%date))]
    pub async fn scan(&self, date: NaiveDate) -> Result<ScanReport, OutcomeError> {
        let now = self.clock.now();
        let from = start_of_day(date, self.timezone);
        let to = end_of_day(date, self.timezone).min(now);

        let mut report = ScanReport {
            date: Some(date),
            ..ScanReport::default()
        };
        if from >= to {
            return Ok(report);
        }

        let bookings = self
            .repo
            .fetch_in_range(from.timestamp_millis(), to.timestamp_millis())
            .await
            .map_err(OutcomeError::Storage)?;

        for booking in bookings {
            if booking.status == BookingStatus::Rescheduled {
                continue;
            }
            let already = self
                .repo
                .fetch_outcome(&booking.booking_id)
                .await
                .map_err(OutcomeError::Storage)?;
            if already.is_some() {
                continue;
            }

            match self.settle(&booking, now).await {
                Verdict::Settled(kind, status) => match self.record(&booking, kind, status, now).await {
                    Ok(Some(outcome)) => report.outcomes.push(outcome),
                    Ok(None) => {}
                    Err(why) => report.deferred.push((booking.booking_id, why)),
                },
                Verdict::Deferred(why) => report.deferred.push((booking.booking_id, why)),
                Verdict::Skip => {}
            }
        }

        info!(
            outcomes = report.outcomes.len(),
            deferred = report.deferred.len(),
            "outcome scan finished"
        );
        Ok(report)
    }

    /// Reads the event and decides the outcome and the status it implies.
    async fn settle(&self, booking: &Booking, now: DateTime<Utc>) -> Verdict {
        let event = match self
            .calendar
            .get_event(&booking.event.calendar_id, &booking.event.event_id)
            .await
        {
            Ok(ev) => ev,
            Err(CalendarError::NotFound(_)) => {
                // deleted by hand: the appointment did not happen
                return Verdict::Settled(OutcomeKind::Cancelled, BookingStatus::Cancelled);
            }
            Err(e) => {
                bump(&self.counters.calendar_failures);
                return Verdict::Deferred(Deferral::CalendarUnavailable(e.to_string()));
            }
        };

        match status_from_color(event.color, &event.title) {
            s @ (BookingStatus::Attended | BookingStatus::Recall | BookingStatus::Special) => {
                Verdict::Settled(OutcomeKind::Attended, s)
            }
            BookingStatus::Cancelled => Verdict::Settled(OutcomeKind::Cancelled, BookingStatus::Cancelled),
            BookingStatus::Rescheduled => Verdict::Skip,
            BookingStatus::NoShow => Verdict::Settled(OutcomeKind::NoShow, BookingStatus::NoShow),
            BookingStatus::Ghost => Verdict::Settled(OutcomeKind::Ghost, BookingStatus::Ghost),
            BookingStatus::Pending => {
                let local_day = local_date(booking.starts_at, self.timezone);
                let deadline = end_of_day(local_day, self.timezone) + self.no_show_grace;
                if now >= deadline {
                    Verdict::Settled(OutcomeKind::NoShow, BookingStatus::NoShow)
                } else {
                    Verdict::Deferred(Deferral::AwaitingDeadline)
                }
            }
        }
    }

    /// Applies repeat no-show escalation, brings calendar and mirror in line
    /// with the outcome, then inserts it. `Ok(None)` means another run
    /// recorded it first.
    async fn record(
        &self,
        booking: &Booking,
        mut kind: OutcomeKind,
        mut status: BookingStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<BookingOutcome>, Deferral> {
        if kind == OutcomeKind::NoShow {
            match self
                .repo
                .count_customer_no_shows(&booking.customer, &booking.booking_id)
                .await
            {
                Ok(n) if n > 0 => {
                    kind = OutcomeKind::Ghost;
                    status = BookingStatus::Ghost;
                    bump(&self.counters.ghost_escalations);
                    info!(booking_id = %booking.booking_id, previous = n, "repeat no-show escalated to ghost");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "no-show history unavailable");
                    return Err(Deferral::Storage(e.to_string()));
                }
            }
        }

        if booking.status != status {
            if let Err(e) = self.align_status(booking, status, now).await {
                warn!(booking_id = %booking.booking_id, error = %e, "could not write outcome status");
                return Err(match e {
                    SyncError::Calendar(c) => Deferral::CalendarUnavailable(c.to_string()),
                    other => Deferral::Storage(other.to_string()),
                });
            }
        }

        let outcome = BookingOutcome {
            booking_id: booking.booking_id,
            kind,
            recorded_ms: now.timestamp_millis(),
        };
        match self.repo.insert_outcome(&outcome).await {
            Ok(true) => {
                bump(&self.counters.outcomes_recorded);
                Ok(Some(outcome))
            }
            Ok(false) => {
                debug!(booking_id = %booking.booking_id, "outcome already recorded");
                Ok(None)
            }
            Err(e) => {
                warn!(booking_id = %booking.booking_id, error = %e, "outcome insert failed");
                Err(Deferral::Storage(e.to_string()))
            }
        }
    }

    /// Writes through the synchronizer when the calendar needs the new color;
    /// otherwise (the calendar already shows it, or the event is gone) only
    /// the local record changes.
    async fn align_status(
        &self,
        booking: &Booking,
        status: BookingStatus,
        now: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let calendar_write = (booking.status == BookingStatus::Pending
            && matches!(status, BookingStatus::NoShow | BookingStatus::Ghost))
            || (booking.status == BookingStatus::NoShow && status == BookingStatus::Ghost);

        if calendar_write {
            self.sync.apply_status(booking.booking_id, status).await?;
            return Ok(());
        }

        if !booking.status.can_transition_to(status) {
            return Err(SyncError::InvalidTransition {
                from: booking.status,
                to: status,
            });
        }
        self.repo
            .update_status(&booking.booking_id, status, None, now.timestamp_millis())
            .await
            .map_err(SyncError::Storage)
    }
}
