use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

pub type BookingId = Uuid;

/// Canonical lifecycle status of a booking. The calendar color (plus the
/// ghost title suffix) is the durable encoding of this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BookingStatus {
    Pending,
    Attended,
    Recall,
    Special,
    Rescheduled,
    NoShow,
    Ghost,
    Cancelled,
}

impl BookingStatus {
    pub const ALL: [BookingStatus; 8] = [
        BookingStatus::Pending,
        BookingStatus::Attended,
        BookingStatus::Recall,
        BookingStatus::Special,
        BookingStatus::Rescheduled,
        BookingStatus::NoShow,
        BookingStatus::Ghost,
        BookingStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Attended => "attended",
            BookingStatus::Recall => "recall",
            BookingStatus::Special => "special",
            BookingStatus::Rescheduled => "rescheduled",
            BookingStatus::NoShow => "no_show",
            BookingStatus::Ghost => "ghost",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    /// Whether an event in this status still occupies its slot.
    pub fn holds_capacity(self) -> bool {
        !matches!(self, BookingStatus::Rescheduled | BookingStatus::Cancelled)
    }

    /// Allowed transitions. Re-applying the current status is always allowed
    /// (idempotent writes); beyond that only `pending` moves, except the
    /// `no_show -> ghost` escalation.
    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        if self == next {
            return true;
        }
        match self {
            BookingStatus::Pending => true,
            BookingStatus::NoShow => next == BookingStatus::Ghost,
            _ => false,
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BookingStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Invalid BookingStatus value: {}", s))
    }
}

/// Appointment flavours. Coaching appointments are placed on a coach's
/// calendar chosen by the bucket draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AppointmentKind {
    Consultation,
    Coaching,
}

impl AppointmentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentKind::Consultation => "consultation",
            AppointmentKind::Coaching => "coaching",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AppointmentKind::Consultation => "Consultation",
            AppointmentKind::Coaching => "Coaching",
        }
    }
}

impl fmt::Display for AppointmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppointmentKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "consultation" => Ok(AppointmentKind::Consultation),
            "coaching" => Ok(AppointmentKind::Coaching),
            other => Err(anyhow::anyhow!("Invalid AppointmentKind value: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomerInfo {
    pub name: String,
    /// Email address or phone number.
    pub contact: String,
}

impl CustomerInfo {
    pub fn new(name: impl Into<String>, contact: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contact: contact.into(),
        }
    }

    /// Case- and whitespace-insensitive name key used to match repeat customers.
    pub fn name_key(&self) -> String {
        self.name
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Contact key: lowercased email, or the digits of a phone number.
    pub fn contact_key(&self) -> String {
        let c = self.contact.trim();
        if c.contains('@') {
            c.to_lowercase()
        } else {
            c.chars().filter(char::is_ascii_digit).collect()
        }
    }
}

/// Pointer to the calendar event backing a booking.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventRef {
    pub calendar_id: String,
    pub event_id: String,
}

/// Local mirror of a confirmed appointment. Only ever persisted after its
/// calendar event exists, so `event` is always set.
#[derive(Debug, Clone, PartialEq)]
pub struct Booking {
    pub booking_id: BookingId,
    pub owner_id: String,
    pub customer: CustomerInfo,
    pub staff_id: String,
    pub kind: AppointmentKind,
    pub starts_at: DateTime<Utc>,
    pub duration_min: u32,
    pub event: EventRef,
    pub status: BookingStatus,
    /// Set on a `rescheduled` booking: the booking that superseded it.
    pub rescheduled_to: Option<BookingId>,
    pub created_ms: i64,
    pub updated_ms: i64,
}

impl Booking {
    pub fn ends_at(&self) -> DateTime<Utc> {
        self.starts_at + Duration::minutes(i64::from(self.duration_min))
    }
}

/// Terminal judgement on a past booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeKind {
    Attended,
    NoShow,
    /// Repeat no-show by the same customer.
    Ghost,
    Cancelled,
}

impl OutcomeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeKind::Attended => "attended",
            OutcomeKind::NoShow => "no_show",
            OutcomeKind::Ghost => "ghost",
            OutcomeKind::Cancelled => "cancelled",
        }
    }

    pub fn is_no_show(self) -> bool {
        matches!(self, OutcomeKind::NoShow | OutcomeKind::Ghost)
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutcomeKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "attended" => Ok(OutcomeKind::Attended),
            "no_show" => Ok(OutcomeKind::NoShow),
            "ghost" => Ok(OutcomeKind::Ghost),
            "cancelled" => Ok(OutcomeKind::Cancelled),
            other => Err(anyhow::anyhow!("Invalid OutcomeKind value: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingOutcome {
    pub booking_id: BookingId,
    pub kind: OutcomeKind,
    pub recorded_ms: i64,
}
