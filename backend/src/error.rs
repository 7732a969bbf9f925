use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::booking::model::BookingStatus;
use crate::calendar::CalendarError;

/// One rejected input field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

/// All field-level problems found in one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<FieldError>);

impl ValidationErrors {
    pub fn push(&mut self, field: &'static str, message: impl Into<String>) {
        self.0.push(FieldError {
            field,
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn has(&self, field: &str) -> bool {
        self.0.iter().any(|e| e.field == field)
    }

    pub fn single(field: &'static str, message: impl Into<String>) -> Self {
        let mut errs = Self::default();
        errs.push(field, message);
        errs
    }

    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", e.field, e.message)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum AvailabilityError {
    #[error("unknown staff member: {0}")]
    UnknownStaff(String),

    #[error("invalid date range {start}..={end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },

    #[error("date {0} is beyond the booking horizon")]
    HorizonExceeded(NaiveDate),

    #[error("no availability snapshot yet for {0}")]
    NotReady(String),

    #[error("calendar unavailable: {0}")]
    Calendar(#[from] CalendarError),
}

#[derive(Error, Debug)]
pub enum BookingError {
    #[error("slot at {starts_at} is full ({booked}/{capacity})")]
    SlotFull {
        starts_at: DateTime<Utc>,
        capacity: u32,
        booked: u32,
    },

    #[error("slot is blocked: {0}")]
    SlotBlocked(String),

    #[error("invalid booking request: {0}")]
    Validation(ValidationErrors),

    #[error("calendar unavailable: {0}")]
    CalendarUnavailable(#[from] CalendarError),

    /// The calendar event exists but the local record does not; the
    /// reconciliation audit reports the event as an orphan.
    #[error("calendar event {event_id} created but booking record not persisted: {source}")]
    Unrecorded {
        event_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("unknown staff member: {0}")]
    UnknownStaff(String),

    #[error("booking storage failed: {0}")]
    Storage(#[source] anyhow::Error),
}

impl From<ValidationErrors> for BookingError {
    fn from(e: ValidationErrors) -> Self {
        BookingError::Validation(e)
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("booking not found: {0}")]
    BookingNotFound(Uuid),

    #[error("cannot move booking from {from} to {to}")]
    InvalidTransition { from: BookingStatus, to: BookingStatus },

    #[error("calendar unavailable: {0}")]
    Calendar(#[from] CalendarError),

    #[error("booking storage failed: {0}")]
    Storage(#[source] anyhow::Error),
}

/// Failure of the compound reschedule transition. Each variant states which
/// side effects happened.
#[derive(Error, Debug)]
pub enum RescheduleError {
    #[error("booking not found: {0}")]
    BookingNotFound(Uuid),

    #[error("only pending bookings can be rescheduled (booking is {0})")]
    NotPending(BookingStatus),

    #[error("could not read the original event: {0}")]
    Calendar(#[from] CalendarError),

    /// Nothing changed: the replacement booking was not created.
    #[error("replacement booking failed: {0}")]
    NewBookingFailed(#[source] BookingError),

    /// The replacement exists but the original was not marked rescheduled.
    /// `compensated` tells whether the replacement was cancelled again.
    #[error(
        "replacement {new_booking_id} created but original not marked rescheduled (compensated: {compensated}): {source}"
    )]
    OriginalNotUpdated {
        new_booking_id: Uuid,
        compensated: bool,
        #[source]
        source: SyncError,
    },

    #[error("booking storage failed: {0}")]
    Storage(#[source] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum BucketError {
    #[error("bucket misconfigured: {0}")]
    Misconfigured(String),

    /// No resource has a positive weight even after a forced reset.
    #[error("bucket has no drawable resource")]
    Empty,

    #[error("bucket update conflicted {0} times in a row")]
    Conflict(usize),

    #[error("bucket storage failed: {0}")]
    Storage(#[source] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum CoachingError {
    #[error("coach draw failed: {0}")]
    Draw(#[from] BucketError),

    #[error("coach {0} has no calendar")]
    UnknownCoach(String),

    #[error("coaching booking with {coach_id} failed: {source}")]
    Booking {
        coach_id: String,
        #[source]
        source: BookingError,
    },
}

#[derive(Error, Debug)]
pub enum OutcomeError {
    #[error("booking storage failed: {0}")]
    Storage(#[source] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("calendar unavailable: {0}")]
    Calendar(#[from] CalendarError),

    #[error("booking storage failed: {0}")]
    Storage(#[source] anyhow::Error),
}
