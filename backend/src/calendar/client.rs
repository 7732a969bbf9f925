use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, SecondsFormat, Utc};
use chrono_tz::Tz;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::calendar::CalendarApi;
use crate::calendar::errors::CalendarError;
use crate::calendar::types::{CalendarEvent, EventColor, EventPage, EventPatch, NewEvent};
use crate::time::start_of_day;

#[derive(Clone, Debug)]
pub struct HttpCalendarConfig {
    /// e.g. `https://www.googleapis.com/calendar/v3`
    pub base_url: String,
    pub access_token: String,
    /// Per-request timeout; every call is bounded.
    pub timeout: Duration,
    /// Total attempts (initial try + retries) for transient failures.
    pub max_attempts: usize,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub page_size: usize,
    /// Used to place all-day events on the timeline.
    pub timezone: Tz,
}

/// REST client for a Google-Calendar-shaped API.
///
/// Rate limiting (429, rate-limit 403), 5xx, timeouts and connect errors are
/// retried with exponential backoff; once attempts are exhausted the caller
/// receives `CalendarError::Unavailable`.
#[derive(Clone)]
pub struct HttpCalendarClient {
    http: Client,
    base: Url,
    cfg: HttpCalendarConfig,
}

impl HttpCalendarClient {
    pub fn new(cfg: HttpCalendarConfig) -> Result<Self, CalendarError> {
        let base = Url::parse(&cfg.base_url)
            .map_err(|e| CalendarError::InvalidResponse(format!("bad base url: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(CalendarError::InvalidResponse(format!(
                "base url cannot carry a path: {}",
                cfg.base_url
            )));
        }

        let http = Client::builder()
            .timeout(cfg.timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(30))
            .build()?;

        Ok(Self { http, base, cfg })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty();
            path.extend(segments);
        }
        url
    }

    fn backoff_delay(&self, attempt: usize, retry_after: Option<Duration>) -> Duration {
        let shift = attempt.saturating_sub(1).min(8) as u32;
        let exp = self.cfg.base_backoff.saturating_mul(1u32 << shift);
        exp.max(retry_after.unwrap_or_default())
            .min(self.cfg.max_backoff)
    }

    /// A 409 on insert means an event with our id exists. It is ours when it
    /// carries the same description and times; otherwise the id collided.
    async fn adopt_existing(
        &self,
        calendar_id: &str,
        id: &str,
        event: &NewEvent,
        reason: String,
    ) -> Result<String, CalendarError> {
        let existing = self.get_event(calendar_id, id).await?;
        if existing.description == event.description
            && existing.start == event.start
            && existing.end == event.end
        {
            debug!(target: "calendar", event_id = %id, "earlier insert attempt had landed");
            return Ok(existing.id);
        }
        Err(CalendarError::Rejected { status: 409, body: reason })
    }

    /// Sends the request built by `build` with the retry budget applied.
    async fn send<F>(&self, resource: &str, build: F) -> Result<Response, CalendarError>
    where
        F: Fn() -> RequestBuilder,
    {
        let attempts = self.cfg.max_attempts.max(1);
        let mut last_reason = String::new();

        for attempt in 1..=attempts {
            let outcome = build()
                .bearer_auth(&self.cfg.access_token)
                .send()
                .await;

            let retry_after = match outcome {
                Ok(resp) => {
                    let status = resp.status();
                    debug!(target: "calendar", attempt, %status, resource, "calendar response");

                    if status.is_success() {
                        return Ok(resp);
                    }
                    if status == StatusCode::NOT_FOUND {
                        return Err(CalendarError::NotFound(resource.to_string()));
                    }

                    let retry_after = parse_retry_after(&resp);
                    let body = resp.text().await.unwrap_or_default();

                    if !is_retryable_status(status, &body) {
                        return Err(CalendarError::Rejected {
                            status: status.as_u16(),
                            body,
                        });
                    }

                    last_reason = format!("{status}: {body}");
                    retry_after
                }
                Err(e) => {
                    if !should_retry_error(&e) {
                        return Err(CalendarError::Http(e));
                    }
                    last_reason = e.to_string();
                    None
                }
            };

            if attempt < attempts {
                let delay = self.backoff_delay(attempt, retry_after);
                warn!(
                    target: "calendar",
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    reason = %last_reason,
                    resource,
                    "transient calendar failure; backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(CalendarError::Unavailable {
            attempts,
            reason: last_reason,
        })
    }
}

#[async_trait]
impl CalendarApi for HttpCalendarClient {
    #[instrument(skip(self), target = "calendar", level = "debug")]
    async fn list_events(
        &self,
        calendar_id: &str,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
        page_token: Option<&str>,
    ) -> Result<EventPage, CalendarError> {
        let url = self.url(&["calendars", calendar_id, "events"]);

        let mut query: Vec<(&str, String)> = vec![
            ("timeMin", time_min.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("timeMax", time_max.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("singleEvents", "true".to_string()),
            ("orderBy", "startTime".to_string()),
            ("maxResults", self.cfg.page_size.to_string()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }

        let resp = self
            .send(calendar_id, || self.http.get(url.clone()).query(&query))
            .await?;
        let list: WireEventList = resp
            .json()
            .await
            .map_err(|e| CalendarError::InvalidResponse(e.to_string()))?;

        let mut items = Vec::with_capacity(list.items.len());
        for raw in list.items {
            if raw.status.as_deref() == Some("cancelled") {
                continue;
            }
            let id = raw.id.clone();
            match raw.into_event(calendar_id, self.cfg.timezone) {
                Ok(ev) => items.push(ev),
                Err(e) => {
                    // poison-row resilience: skip but keep the page
                    warn!(target: "calendar", event_id = %id, error = %e, "skipping malformed event");
                }
            }
        }

        Ok(EventPage {
            items,
            next_page_token: list.next_page_token,
        })
    }

    #[instrument(skip(self), target = "calendar", level = "debug")]
    async fn get_event(
        &self,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<CalendarEvent, CalendarError> {
        let url = self.url(&["calendars", calendar_id, "events", event_id]);

        let resp = self.send(event_id, || self.http.get(url.clone())).await?;
        let raw: WireEvent = resp
            .json()
            .await
            .map_err(|e| CalendarError::InvalidResponse(e.to_string()))?;

        if raw.status.as_deref() == Some("cancelled") {
            return Err(CalendarError::NotFound(event_id.to_string()));
        }

        raw.into_event(calendar_id, self.cfg.timezone)
            .map_err(CalendarError::InvalidResponse)
    }

    #[instrument(skip(self, event), target = "calendar", level = "debug")]
    async fn create_event(
        &self,
        calendar_id: &str,
        event: &NewEvent,
    ) -> Result<String, CalendarError> {
        let url = self.url(&["calendars", calendar_id, "events"]);
        // client-chosen id: a retried insert that already landed answers 409
        let id = new_event_id();
        let body = WireNewEvent {
            id: &id,
            summary: &event.title,
            description: &event.description,
            start: WireTime::at(event.start),
            end: WireTime::at(event.end),
            color_id: event.color.map(|c| c.id().to_string()),
        };

        let resp = match self
            .send(calendar_id, || self.http.post(url.clone()).json(&body))
            .await
        {
            Ok(resp) => resp,
            Err(CalendarError::Rejected { status: 409, body: reason }) => {
                return self.adopt_existing(calendar_id, &id, event, reason).await;
            }
            Err(e) => return Err(e),
        };
        let created: WireCreated = resp
            .json()
            .await
            .map_err(|e| CalendarError::InvalidResponse(e.to_string()))?;

        debug!(target: "calendar", event_id = %created.id, "calendar event created");
        Ok(created.id)
    }

    #[instrument(skip(self, patch), target = "calendar", level = "debug")]
    async fn update_event(
        &self,
        calendar_id: &str,
        event_id: &str,
        patch: &EventPatch,
    ) -> Result<(), CalendarError> {
        if patch.is_empty() {
            return Ok(());
        }

        let url = self.url(&["calendars", calendar_id, "events", event_id]);
        let body = patch_body(patch);

        self.send(event_id, || self.http.patch(url.clone()).json(&body))
            .await?;
        Ok(())
    }
}

fn patch_body(patch: &EventPatch) -> serde_json::Value {
    let mut body = serde_json::Map::new();
    if let Some(title) = &patch.title {
        body.insert("summary".into(), title.clone().into());
    }
    if let Some(description) = &patch.description {
        body.insert("description".into(), description.clone().into());
    }
    if let Some(color) = patch.color {
        let value = match color {
            Some(c) => serde_json::Value::String(c.id().to_string()),
            None => serde_json::Value::Null,
        };
        body.insert("colorId".into(), value);
    }
    serde_json::Value::Object(body)
}

fn parse_retry_after(resp: &Response) -> Option<Duration> {
    resp.headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn is_retryable_status(status: StatusCode, body: &str) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
        || (status == StatusCode::FORBIDDEN && body.contains("RateLimitExceeded"))
        || (status == StatusCode::FORBIDDEN && body.contains("rateLimitExceeded"))
}

fn should_retry_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/* =========================
Wire format
========================= */

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEventList {
    #[serde(default)]
    items: Vec<WireEvent>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEvent {
    id: String,
    summary: Option<String>,
    description: Option<String>,
    color_id: Option<String>,
    start: Option<WireTime>,
    end: Option<WireTime>,
    created: Option<DateTime<Utc>>,
    status: Option<String>,
}

impl WireEvent {
    fn into_event(self, calendar_id: &str, tz: Tz) -> Result<CalendarEvent, String> {
        let start = self
            .start
            .and_then(|t| t.resolve(tz))
            .ok_or_else(|| format!("event {} has no start", self.id))?;
        let end = self
            .end
            .and_then(|t| t.resolve(tz))
            .ok_or_else(|| format!("event {} has no end", self.id))?;

        Ok(CalendarEvent {
            id: self.id,
            calendar_id: calendar_id.to_string(),
            title: self.summary.unwrap_or_default(),
            description: self.description.unwrap_or_default(),
            color: self.color_id.as_deref().and_then(EventColor::from_wire),
            start,
            end,
            created: self.created,
        })
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireTime {
    #[serde(skip_serializing_if = "Option::is_none")]
    date_time: Option<DateTime<FixedOffset>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    date: Option<NaiveDate>,
}

impl WireTime {
    fn at(t: DateTime<Utc>) -> Self {
        Self {
            date_time: Some(t.fixed_offset()),
            date: None,
        }
    }

    /// Timed events carry an instant; all-day events start at local midnight.
    fn resolve(&self, tz: Tz) -> Option<DateTime<Utc>> {
        match (self.date_time, self.date) {
            (Some(dt), _) => Some(dt.with_timezone(&Utc)),
            (None, Some(d)) => Some(start_of_day(d, tz)),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireNewEvent<'a> {
    id: &'a str,
    summary: &'a str,
    description: &'a str,
    start: WireTime,
    end: WireTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    color_id: Option<String>,
}

/// Event ids are base32hex (`0-9a-v`), 5 to 1024 characters; a simple
/// uuid fits.
fn new_event_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[derive(Debug, Deserialize)]
struct WireCreated {
    id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> HttpCalendarClient {
        HttpCalendarClient::new(HttpCalendarConfig {
            base_url: base.to_string(),
            access_token: "t".into(),
            timeout: Duration::from_secs(1),
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1_000),
            page_size: 50,
            timezone: chrono_tz::Europe::Paris,
        })
        .unwrap()
    }

    #[test]
    fn event_ids_are_base32hex() {
        let id = new_event_id();
        assert!((5..=1024).contains(&id.len()));
        assert!(id.chars().all(|c| matches!(c, '0'..='9' | 'a'..='v')));
        assert_ne!(id, new_event_id());
    }

    #[test]
    fn url_segments_are_escaped() {
        let c = client("https://calendar.example/v3/");
        let url = c.url(&["calendars", "team#1@group", "events"]);
        assert_eq!(
            url.as_str(),
            "https://calendar.example/v3/calendars/team%231@group/events"
        );
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let c = client("https://calendar.example/v3");
        assert_eq!(c.backoff_delay(1, None), Duration::from_millis(100));
        assert_eq!(c.backoff_delay(2, None), Duration::from_millis(200));
        assert_eq!(c.backoff_delay(3, None), Duration::from_millis(400));
        assert_eq!(c.backoff_delay(9, None), Duration::from_millis(1_000));
        assert_eq!(
            c.backoff_delay(1, Some(Duration::from_secs(30))),
            Duration::from_millis(1_000)
        );
    }

    #[test]
    fn patch_body_clears_color_with_null() {
        let body = patch_body(&EventPatch {
            title: None,
            description: None,
            color: Some(None),
        });
        assert_eq!(body, serde_json::json!({ "colorId": null }));

        let body = patch_body(&EventPatch {
            title: Some("x".into()),
            description: None,
            color: Some(Some(EventColor::Tangerine)),
        });
        assert_eq!(body, serde_json::json!({ "summary": "x", "colorId": "6" }));
    }

    #[test]
    fn rate_limit_403_is_retryable() {
        assert!(is_retryable_status(
            StatusCode::FORBIDDEN,
            r#"{"error":{"errors":[{"reason":"userRateLimitExceeded"}]}}"#
        ));
        assert!(!is_retryable_status(StatusCode::FORBIDDEN, "forbidden"));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY, ""));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST, ""));
    }

    #[test]
    fn all_day_events_start_at_local_midnight() {
        let t = WireTime {
            date_time: None,
            date: NaiveDate::from_ymd_opt(2026, 12, 24),
        };
        let at = t.resolve(chrono_tz::Europe::Paris).unwrap();
        assert_eq!(at.to_rfc3339(), "2026-12-23T23:00:00+00:00");
    }
}
