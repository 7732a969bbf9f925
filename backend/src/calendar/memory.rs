//! In-process calendar.
//!
//! Behaves like the remote calendar for everything this system relies on
//! (paging, patch semantics, not-found) and lets callers inject upstream
//! failures per operation. Used for local runs without credentials and by
//! the test-suite.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::calendar::CalendarApi;
use crate::calendar::errors::CalendarError;
use crate::calendar::types::{CalendarEvent, EventPage, EventPatch, NewEvent};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CalendarOp {
    List,
    Get,
    Create,
    Update,
}

#[derive(Default)]
struct Inner {
    events: BTreeMap<String, Vec<CalendarEvent>>,
    seq: u64,
    offline: bool,
    fail_next: Vec<(CalendarOp, usize)>,
    calls: Vec<CalendarOp>,
}

impl Inner {
    fn check(&mut self, op: CalendarOp) -> Result<(), CalendarError> {
        self.calls.push(op);
        if self.offline {
            return Err(unavailable("calendar offline"));
        }
        if let Some(slot) = self.fail_next.iter_mut().find(|(o, n)| *o == op && *n > 0) {
            slot.1 -= 1;
            return Err(unavailable("injected failure"));
        }
        Ok(())
    }

    fn find_mut(&mut self, calendar_id: &str, event_id: &str) -> Option<&mut CalendarEvent> {
        self.events
            .get_mut(calendar_id)?
            .iter_mut()
            .find(|e| e.id == event_id)
    }
}

fn unavailable(reason: &str) -> CalendarError {
    CalendarError::Unavailable {
        attempts: 1,
        reason: reason.to_string(),
    }
}

pub struct MemoryCalendar {
    inner: Mutex<Inner>,
    page_size: usize,
}

impl Default for MemoryCalendar {
    fn default() -> Self {
        Self::new(250)
    }
}

impl MemoryCalendar {
    pub fn new(page_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            page_size: page_size.max(1),
        }
    }

    /// Makes every subsequent call fail as unavailable until cleared.
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().offline = offline;
    }

    /// Fails the next `n` calls of kind `op`.
    pub fn fail_next(&self, op: CalendarOp, n: usize) {
        self.inner.lock().fail_next.push((op, n));
    }

    pub fn call_count(&self, op: CalendarOp) -> usize {
        self.inner.lock().calls.iter().filter(|o| **o == op).count()
    }

    /// Adds an event directly, as a human editing the calendar would.
    pub fn insert_event(&self, calendar_id: &str, event: NewEvent) -> String {
        let mut inner = self.inner.lock();
        insert(&mut inner, calendar_id, &event)
    }

    /// Edits an event directly, bypassing failure injection.
    pub fn edit_event(&self, calendar_id: &str, event_id: &str, patch: &EventPatch) -> bool {
        let mut inner = self.inner.lock();
        match inner.find_mut(calendar_id, event_id) {
            Some(ev) => {
                ev.apply(patch);
                true
            }
            None => false,
        }
    }

    /// Deletes an event directly.
    pub fn remove_event(&self, calendar_id: &str, event_id: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.events.get_mut(calendar_id) {
            Some(list) => {
                let before = list.len();
                list.retain(|e| e.id != event_id);
                list.len() != before
            }
            None => false,
        }
    }

    pub fn event(&self, calendar_id: &str, event_id: &str) -> Option<CalendarEvent> {
        self.inner
            .lock()
            .find_mut(calendar_id, event_id)
            .map(|e| e.clone())
    }

    pub fn events(&self, calendar_id: &str) -> Vec<CalendarEvent> {
        self.inner
            .lock()
            .events
            .get(calendar_id)
            .cloned()
            .unwrap_or_default()
    }
}

fn insert(inner: &mut Inner, calendar_id: &str, event: &NewEvent) -> String {
    inner.seq += 1;
    let id = format!("evt{:08}", inner.seq);

    inner
        .events
        .entry(calendar_id.to_string())
        .or_default()
        .push(CalendarEvent {
            id: id.clone(),
            calendar_id: calendar_id.to_string(),
            title: event.title.clone(),
            description: event.description.clone(),
            color: event.color,
            start: event.start,
            end: event.end,
            created: Some(Utc::now()),
        });

    id
}

#[async_trait]
impl CalendarApi for MemoryCalendar {
    async fn list_events(
        &self,
        calendar_id: &str,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
        page_token: Option<&str>,
    ) -> Result<EventPage, CalendarError> {
        let mut inner = self.inner.lock();
        inner.check(CalendarOp::List)?;

        let offset = match page_token {
            Some(t) => t
                .parse::<usize>()
                .map_err(|_| CalendarError::Rejected {
                    status: 400,
                    body: format!("bad page token {t}"),
                })?,
            None => 0,
        };

        let mut matching: Vec<CalendarEvent> = inner
            .events
            .get(calendar_id)
            .map(|list| {
                list.iter()
                    .filter(|e| e.overlaps(time_min, time_max))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        matching.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.id.cmp(&b.id)));

        let items: Vec<CalendarEvent> = matching
            .iter()
            .skip(offset)
            .take(self.page_size)
            .cloned()
            .collect();
        let next = offset + items.len();
        let next_page_token = (next < matching.len()).then(|| next.to_string());

        Ok(EventPage {
            items,
            next_page_token,
        })
    }

    async fn get_event(
        &self,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<CalendarEvent, CalendarError> {
        let mut inner = self.inner.lock();
        inner.check(CalendarOp::Get)?;
        inner
            .find_mut(calendar_id, event_id)
            .map(|e| e.clone())
            .ok_or_else(|| CalendarError::NotFound(event_id.to_string()))
    }

    async fn create_event(
        &self,
        calendar_id: &str,
        event: &NewEvent,
    ) -> Result<String, CalendarError> {
        let mut inner = self.inner.lock();
        inner.check(CalendarOp::Create)?;
        Ok(insert(&mut inner, calendar_id, event))
    }

    async fn update_event(
        &self,
        calendar_id: &str,
        event_id: &str,
        patch: &EventPatch,
    ) -> Result<(), CalendarError> {
        let mut inner = self.inner.lock();
        inner.check(CalendarOp::Update)?;
        match inner.find_mut(calendar_id, event_id) {
            Some(ev) => {
                ev.apply(patch);
                Ok(())
            }
            None => Err(CalendarError::NotFound(event_id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::{list_all_events, list_events_for};
    use chrono::Duration;

    fn at(h: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_800_000_000 + h * 3600, 0).unwrap()
    }

    fn new_event(h: i64) -> NewEvent {
        NewEvent {
            title: format!("ev {h}"),
            description: String::new(),
            start: at(h),
            end: at(h) + Duration::hours(1),
            color: None,
        }
    }

    #[tokio::test]
    async fn several_calendars_come_back_in_the_order_asked() {
        let cal = MemoryCalendar::new(1);
        cal.insert_event("b", new_event(0));
        cal.insert_event("a", new_event(1));
        cal.insert_event("a", new_event(2));

        let ids = ["b".to_string(), "a".to_string()];
        let events = list_events_for(&cal, &ids, at(0), at(10)).await.unwrap();
        let titles: Vec<_> = events.iter().map(|e| e.title.as_str()).collect();
        assert_eq!(titles, ["ev 0", "ev 1", "ev 2"]);

        cal.fail_next(CalendarOp::List, 1);
        assert!(list_events_for(&cal, &ids, at(0), at(10)).await.is_err());
    }

    #[tokio::test]
    async fn pages_are_followed_to_the_end() {
        let cal = MemoryCalendar::new(2);
        for h in 0..5 {
            cal.insert_event("c", new_event(h));
        }

        let first = cal.list_events("c", at(0), at(10), None).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.next_page_token.as_deref(), Some("2"));

        let all = list_all_events(&cal, "c", at(0), at(10)).await.unwrap();
        assert_eq!(all.len(), 5);
        assert!(all.windows(2).all(|w| w[0].start <= w[1].start));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let cal = MemoryCalendar::default();
        cal.fail_next(CalendarOp::Create, 1);

        assert!(cal.create_event("c", &new_event(1)).await.is_err());
        assert!(cal.create_event("c", &new_event(1)).await.is_ok());
        assert_eq!(cal.call_count(CalendarOp::Create), 2);
    }

    #[tokio::test]
    async fn missing_event_is_not_found() {
        let cal = MemoryCalendar::default();
        let err = cal.get_event("c", "nope").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
