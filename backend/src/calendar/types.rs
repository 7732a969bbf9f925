use std::fmt;

use chrono::{DateTime, Utc};

/// Fixed event palette of the calendar UI. The numeric id is what travels on
/// the wire (`colorId`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventColor {
    Lavender,
    Sage,
    Grape,
    Flamingo,
    Banana,
    Tangerine,
    Peacock,
    Graphite,
    Blueberry,
    Basil,
    Tomato,
}

impl EventColor {
    pub const ALL: [EventColor; 11] = [
        EventColor::Lavender,
        EventColor::Sage,
        EventColor::Grape,
        EventColor::Flamingo,
        EventColor::Banana,
        EventColor::Tangerine,
        EventColor::Peacock,
        EventColor::Graphite,
        EventColor::Blueberry,
        EventColor::Basil,
        EventColor::Tomato,
    ];

    pub fn id(self) -> u8 {
        match self {
            EventColor::Lavender => 1,
            EventColor::Sage => 2,
            EventColor::Grape => 3,
            EventColor::Flamingo => 4,
            EventColor::Banana => 5,
            EventColor::Tangerine => 6,
            EventColor::Peacock => 7,
            EventColor::Graphite => 8,
            EventColor::Blueberry => 9,
            EventColor::Basil => 10,
            EventColor::Tomato => 11,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.id() == id)
    }

    /// Parses the wire representation (`"1"`..`"11"`). Unknown ids read as
    /// no color, the same as an event left on the calendar default.
    pub fn from_wire(raw: &str) -> Option<Self> {
        raw.trim().parse::<u8>().ok().and_then(Self::from_id)
    }
}

impl fmt::Display for EventColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventColor::Lavender => "lavender",
            EventColor::Sage => "sage",
            EventColor::Grape => "grape",
            EventColor::Flamingo => "flamingo",
            EventColor::Banana => "banana",
            EventColor::Tangerine => "tangerine",
            EventColor::Peacock => "peacock",
            EventColor::Graphite => "graphite",
            EventColor::Blueberry => "blueberry",
            EventColor::Basil => "basil",
            EventColor::Tomato => "tomato",
        };
        f.write_str(s)
    }
}

/// A calendar event as seen by this system.
#[derive(Clone, Debug, PartialEq)]
pub struct CalendarEvent {
    pub id: String,
    pub calendar_id: String,
    pub title: String,
    pub description: String,
    pub color: Option<EventColor>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Creation time reported by the calendar; orders competing bookings
    /// during the post-commit capacity audit.
    pub created: Option<DateTime<Utc>>,
}

impl CalendarEvent {
    /// Half-open interval overlap with `[start, end)`.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start < end && start < self.end
    }

    /// Applies a patch the way the calendar would.
    pub fn apply(&mut self, patch: &EventPatch) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(description) = &patch.description {
            self.description = description.clone();
        }
        if let Some(color) = patch.color {
            self.color = color;
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct EventPage {
    pub items: Vec<CalendarEvent>,
    pub next_page_token: Option<String>,
}

#[derive(Clone, Debug)]
pub struct NewEvent {
    pub title: String,
    pub description: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub color: Option<EventColor>,
}

/// Partial update. `None` leaves a field untouched; `color: Some(None)`
/// resets the event to the calendar default color.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EventPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub color: Option<Option<EventColor>>,
}

impl EventPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.description.is_none() && self.color.is_none()
    }
}
