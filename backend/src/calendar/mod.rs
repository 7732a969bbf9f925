pub mod client;
pub mod errors;
pub mod memory;
pub mod types;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use tracing::warn;

pub use client::{HttpCalendarClient, HttpCalendarConfig};
pub use errors::CalendarError;
pub use memory::{CalendarOp, MemoryCalendar};
pub use types::*;

/// Upper bound on pages followed by `list_all_events` for one query.
pub const MAX_PAGES: usize = 100;

/// Boundary to the external calendar system, the source of truth for
/// scheduling facts. Every call is network I/O and may be slow or fail;
/// implementations own their retry budget.
#[async_trait]
pub trait CalendarApi: Send + Sync {
    async fn list_events(
        &self,
        calendar_id: &str,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
        page_token: Option<&str>,
    ) -> Result<EventPage, CalendarError>;

    async fn get_event(
        &self,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<CalendarEvent, CalendarError>;

    /// Creates an event and returns its id.
    async fn create_event(
        &self,
        calendar_id: &str,
        event: &NewEvent,
    ) -> Result<String, CalendarError>;

    async fn update_event(
        &self,
        calendar_id: &str,
        event_id: &str,
        patch: &EventPatch,
    ) -> Result<(), CalendarError>;

    async fn set_color(
        &self,
        calendar_id: &str,
        event_id: &str,
        color: Option<EventColor>,
    ) -> Result<(), CalendarError> {
        let patch = EventPatch {
            color: Some(color),
            ..EventPatch::default()
        };
        self.update_event(calendar_id, event_id, &patch).await
    }
}

/// Lists every event overlapping `[time_min, time_max)` by following page
/// tokens. A listing that needs more than `MAX_PAGES` pages is an error, never
/// a truncated answer.
pub async fn list_all_events(
    api: &dyn CalendarApi,
    calendar_id: &str,
    time_min: DateTime<Utc>,
    time_max: DateTime<Utc>,
) -> Result<Vec<CalendarEvent>, CalendarError> {
    let mut out = Vec::new();
    let mut token: Option<String> = None;

    for _ in 0..MAX_PAGES {
        let page = api
            .list_events(calendar_id, time_min, time_max, token.as_deref())
            .await?;
        out.extend(page.items);

        match page.next_page_token {
            Some(next) => token = Some(next),
            None => return Ok(out),
        }
    }

    warn!(
        target: "calendar",
        calendar_id,
        pages = MAX_PAGES,
        "page ceiling reached"
    );
    Err(CalendarError::PageLimit {
        calendar_id: calendar_id.to_string(),
        pages: MAX_PAGES,
    })
}

/// Lists events across several calendars concurrently, failing on the first
/// error. Events come back grouped in `calendar_ids` order.
pub async fn list_events_for(
    api: &dyn CalendarApi,
    calendar_ids: &[String],
    time_min: DateTime<Utc>,
    time_max: DateTime<Utc>,
) -> Result<Vec<CalendarEvent>, CalendarError> {
    let pages = try_join_all(
        calendar_ids
            .iter()
            .map(|calendar_id| list_all_events(api, calendar_id, time_min, time_max)),
    )
    .await?;
    Ok(pages.into_iter().flatten().collect())
}
