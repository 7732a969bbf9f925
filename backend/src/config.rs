use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::NaiveTime;
use chrono_tz::Tz;

use crate::availability::occupancy::{CapacityPolicy, CapacityScope, SchedulingRules};
use crate::availability::roster::{Role, Roster, StaffMember};
use crate::availability::template::{BlockedDates, WeeklyTemplate};
use crate::bucket::model::BucketConfig;
use crate::calendar::HttpCalendarConfig;

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Database connection string.
    pub database_url: String,
    pub database_max_connections: u32,

    // =========================
    // Calendar adapter
    // =========================
    /// Base URL of the calendar REST API.
    ///
    /// When unset the service runs against the in-process calendar, which
    /// is only meant for local runs and demos.
    pub calendar_api_base: Option<String>,
    pub calendar_access_token: String,
    /// Per-request timeout. Every calendar call is bounded by it.
    pub calendar_timeout: Duration,
    /// Total attempts for a transient failure (initial try + retries).
    pub calendar_max_attempts: usize,
    /// First backoff step; doubles per attempt.
    pub calendar_backoff: Duration,
    pub calendar_page_size: usize,

    // =========================
    // Scheduling
    // =========================
    /// IANA zone the templates, blocked dates and day boundaries live in.
    pub timezone: Tz,
    pub roster: Roster,
    pub template: WeeklyTemplate,
    pub blocked_dates: BlockedDates,
    /// Bookings allowed per consultation slot.
    pub slot_capacity: u32,
    /// Whether consultation capacity is shared across all staff calendars
    /// (`organization`) or counted per calendar (`staff`).
    pub capacity_scope: CapacityScope,
    /// How far ahead slots are offered.
    pub booking_horizon_days: u32,

    // =========================
    // Jobs
    // =========================
    /// Local times at which every staff member's availability is rebuilt.
    pub availability_refresh_times: Vec<NaiveTime>,
    /// Local time of the daily outcome scan.
    pub outcome_scan_time: NaiveTime,
    /// Time after the end of an appointment's day before an unmarked
    /// booking is settled as a no-show.
    ///
    /// 0 means "at end of day".
    pub no_show_grace: chrono::Duration,
    pub reconcile_interval: Duration,
    /// How many past days each reconciliation run audits. Upcoming days up
    /// to the booking horizon are always included.
    pub reconcile_lookback_days: u32,

    // =========================
    // Coach assignment
    // =========================
    pub bucket: BucketConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key/value source. Every malformed
    /// value is reported with the variable it came from.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| -> String {
            get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let timezone: Tz = parse_var("TIMEZONE", &var("TIMEZONE", "Europe/Paris"))?;

        let template = match get("AVAILABILITY_TEMPLATE").filter(|v| !v.trim().is_empty()) {
            Some(raw) => WeeklyTemplate::parse(&raw).context("AVAILABILITY_TEMPLATE")?,
            None => WeeklyTemplate::standard(),
        };

        let roster = build_roster(
            &var("STAFF_CALENDARS", "front-desk=front-desk"),
            &var("STAFF_AVAILABILITY", ""),
            &var("COACH_CALENDARS", "A=coach-a,B=coach-b,C=coach-c"),
        )?;

        let threshold: u32 = parse_var("BUCKET_RESET_THRESHOLD", &var("BUCKET_RESET_THRESHOLD", "20"))?;
        let bucket = BucketConfig::parse(&var("BUCKET_WEIGHTS", "A=9,B=9,C=2"), threshold)
            .context("BUCKET_WEIGHTS")?;
        for id in bucket.defaults().keys() {
            if !roster.get(id).is_some_and(|m| m.role == Role::Coach) {
                bail!("BUCKET_WEIGHTS: resource {id:?} is not listed in COACH_CALENDARS");
            }
        }

        let grace_hours: u32 = parse_var("NO_SHOW_GRACE_HOURS", &var("NO_SHOW_GRACE_HOURS", "0"))?;
        let reconcile_minutes: u64 = parse_var(
            "RECONCILE_INTERVAL_MINUTES",
            &var("RECONCILE_INTERVAL_MINUTES", "60"),
        )?;
        if reconcile_minutes == 0 {
            bail!("RECONCILE_INTERVAL_MINUTES must be at least 1");
        }

        let slot_capacity: u32 = parse_var("SLOT_CAPACITY", &var("SLOT_CAPACITY", "3"))?;
        if slot_capacity == 0 {
            bail!("SLOT_CAPACITY must be at least 1");
        }

        Ok(Self {
            database_url: var("DATABASE_URL", "sqlite://agenda_dev.db?mode=rwc"),
            database_max_connections: parse_var(
                "DATABASE_MAX_CONNECTIONS",
                &var("DATABASE_MAX_CONNECTIONS", "5"),
            )?,

            calendar_api_base: get("CALENDAR_API_BASE").filter(|v| !v.trim().is_empty()),
            calendar_access_token: var("CALENDAR_ACCESS_TOKEN", ""),
            calendar_timeout: Duration::from_secs(parse_var(
                "CALENDAR_TIMEOUT_SECS",
                &var("CALENDAR_TIMEOUT_SECS", "5"),
            )?),
            calendar_max_attempts: parse_var("CALENDAR_MAX_ATTEMPTS", &var("CALENDAR_MAX_ATTEMPTS", "3"))?,
            calendar_backoff: Duration::from_millis(parse_var(
                "CALENDAR_BACKOFF_MS",
                &var("CALENDAR_BACKOFF_MS", "200"),
            )?),
            calendar_page_size: parse_var("CALENDAR_PAGE_SIZE", &var("CALENDAR_PAGE_SIZE", "250"))?,

            timezone,
            roster,
            template,
            blocked_dates: BlockedDates::parse(&var("BLOCKED_DATES", "")).context("BLOCKED_DATES")?,
            slot_capacity,
            capacity_scope: parse_var("CAPACITY_SCOPE", &var("CAPACITY_SCOPE", "organization"))?,
            booking_horizon_days: parse_var("BOOKING_HORIZON_DAYS", &var("BOOKING_HORIZON_DAYS", "60"))?,

            availability_refresh_times: parse_times(
                "AVAILABILITY_REFRESH_TIMES",
                &var("AVAILABILITY_REFRESH_TIMES", "07:00,10:00,13:00,16:00,19:00"),
            )?,
            outcome_scan_time: parse_time("OUTCOME_SCAN_TIME", &var("OUTCOME_SCAN_TIME", "01:00"))?,
            no_show_grace: chrono::Duration::hours(i64::from(grace_hours)),
            reconcile_interval: Duration::from_secs(reconcile_minutes * 60),
            reconcile_lookback_days: parse_var(
                "RECONCILE_LOOKBACK_DAYS",
                &var("RECONCILE_LOOKBACK_DAYS", "7"),
            )?,

            bucket,
        })
    }

    /// Rules shared by availability and booking. Coaches take one booking
    /// per slot on their own calendar.
    pub fn scheduling_rules(&self) -> SchedulingRules {
        SchedulingRules {
            template: self.template.clone(),
            blocked: self.blocked_dates.clone(),
            consultation: CapacityPolicy {
                capacity: self.slot_capacity,
                scope: self.capacity_scope,
            },
            coaching: CapacityPolicy::per_staff(1),
            timezone: self.timezone,
            horizon_days: self.booking_horizon_days,
        }
    }

    /// `None` when no API base is configured.
    pub fn http_calendar(&self) -> Option<HttpCalendarConfig> {
        let base_url = self.calendar_api_base.clone()?;
        Some(HttpCalendarConfig {
            base_url,
            access_token: self.calendar_access_token.clone(),
            timeout: self.calendar_timeout,
            max_attempts: self.calendar_max_attempts.max(1),
            base_backoff: self.calendar_backoff,
            max_backoff: Duration::from_secs(10),
            page_size: self.calendar_page_size,
            timezone: self.timezone,
        })
    }
}

fn parse_var<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| anyhow!("{key}: invalid value {raw:?}: {e}"))
}

fn parse_time(key: &str, raw: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .with_context(|| format!("{key}: expected HH:MM, got {raw:?}"))
}

fn parse_times(key: &str, raw: &str) -> Result<Vec<NaiveTime>> {
    let mut times = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_time(key, s))
        .collect::<Result<Vec<_>>>()?;
    times.sort();
    times.dedup();
    if times.is_empty() {
        bail!("{key}: at least one time is required");
    }
    Ok(times)
}

/// Parses `id=value` pairs, rejecting duplicates.
fn parse_pairs(key: &str, raw: &str) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (id, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("{key}: expected id=value in {pair:?}"))?;
        let (id, value) = (id.trim(), value.trim());
        if id.is_empty() || value.is_empty() {
            bail!("{key}: empty id or value in {pair:?}");
        }
        if out.insert(id.to_string(), value.to_string()).is_some() {
            bail!("{key}: {id:?} listed twice");
        }
    }
    Ok(out)
}

fn build_roster(staff: &str, ratios: &str, coaches: &str) -> Result<Roster> {
    let staff = parse_pairs("STAFF_CALENDARS", staff)?;
    let ratios = parse_pairs("STAFF_AVAILABILITY", ratios)?;
    let coaches = parse_pairs("COACH_CALENDARS", coaches)?;

    let mut members = Vec::with_capacity(staff.len() + coaches.len());
    for (id, calendar_id) in &staff {
        let mut m = StaffMember::new(id.clone(), calendar_id.clone(), Role::Staff);
        if let Some(r) = ratios.get(id) {
            let ratio: f64 = parse_var("STAFF_AVAILABILITY", r)?;
            if !(ratio > 0.0 && ratio <= 1.0) {
                bail!("STAFF_AVAILABILITY: ratio for {id:?} must be in (0, 1], got {ratio}");
            }
            m = m.with_ratio(ratio);
        }
        members.push(m);
    }
    if let Some(unknown) = ratios.keys().find(|id| !staff.contains_key(*id)) {
        bail!("STAFF_AVAILABILITY: {unknown:?} is not listed in STAFF_CALENDARS");
    }

    for (id, calendar_id) in coaches {
        if staff.contains_key(&id) {
            bail!("COACH_CALENDARS: {id:?} is also listed in STAFF_CALENDARS");
        }
        members.push(StaffMember::new(id, calendar_id, Role::Coach));
    }

    let mut calendars: Vec<&str> = members.iter().map(|m| m.calendar_id.as_str()).collect();
    calendars.sort_unstable();
    if calendars.windows(2).any(|w| w[0] == w[1]) {
        bail!("STAFF_CALENDARS/COACH_CALENDARS: a calendar is assigned to two members");
    }

    Ok(Roster::new(members))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<AppConfig> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|k| env.get(k).cloned())
    }

    #[test]
    fn defaults_are_usable() {
        let cfg = load(&[]).unwrap();
        assert_eq!(cfg.slot_capacity, 3);
        assert_eq!(cfg.capacity_scope, CapacityScope::Organization);
        assert_eq!(cfg.availability_refresh_times.len(), 5);
        assert_eq!(cfg.no_show_grace, chrono::Duration::zero());
        assert_eq!(cfg.bucket.reset_threshold(), 20);
        assert!(cfg.calendar_api_base.is_none());
        assert!(cfg.http_calendar().is_none());
        assert_eq!(cfg.roster.with_role(Role::Coach).count(), 3);
        assert_eq!(cfg.timezone, chrono_tz::Europe::Paris);
    }

    #[test]
    fn roster_and_ratios() {
        let cfg = load(&[
            ("STAFF_CALENDARS", "alice=cal-a, bob=cal-b"),
            ("STAFF_AVAILABILITY", "bob=0.5"),
            ("CAPACITY_SCOPE", "staff"),
            ("NO_SHOW_GRACE_HOURS", "12"),
        ])
        .unwrap();
        assert_eq!(cfg.roster.get("bob").unwrap().availability_ratio, 0.5);
        assert_eq!(cfg.roster.get("alice").unwrap().calendar_id, "cal-a");
        assert_eq!(cfg.scheduling_rules().consultation.scope, CapacityScope::Staff);
        assert_eq!(cfg.scheduling_rules().coaching.capacity, 1);
        assert_eq!(cfg.no_show_grace, chrono::Duration::hours(12));
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let err = load(&[("SLOT_CAPACITY", "three")]).unwrap_err();
        assert!(err.to_string().contains("SLOT_CAPACITY"));

        let err = load(&[("TIMEZONE", "Mars/Olympus")]).unwrap_err();
        assert!(err.to_string().contains("TIMEZONE"));

        let err = load(&[("OUTCOME_SCAN_TIME", "25:00")]).unwrap_err();
        assert!(err.to_string().contains("OUTCOME_SCAN_TIME"));

        let err = load(&[("STAFF_AVAILABILITY", "carol=0.5")]).unwrap_err();
        assert!(err.to_string().contains("STAFF_AVAILABILITY"));
    }

    #[test]
    fn bucket_resources_must_be_coaches() {
        let err = load(&[("BUCKET_WEIGHTS", "A=9,Z=1")]).unwrap_err();
        assert!(err.to_string().contains("\"Z\""));

        let cfg = load(&[
            ("COACH_CALENDARS", "x=cal-x,y=cal-y"),
            ("BUCKET_WEIGHTS", "x=1.5,y=0.5"),
            ("BUCKET_RESET_THRESHOLD", "4"),
        ])
        .unwrap();
        assert_eq!(cfg.bucket.defaults().len(), 2);
    }
}
