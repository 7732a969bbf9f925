use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;

/// Source of "now" for every time-sensitive decision (past slots, horizons,
/// outcome deadlines). Injected so jobs and tests agree on a single clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn to_ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub fn from_ms(ms: i64) -> anyhow::Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| anyhow::anyhow!("timestamp out of range: {ms}"))
}

/// The local calendar day `t` falls on in the organization's timezone.
pub fn local_date(t: DateTime<Utc>, tz: Tz) -> NaiveDate {
    t.with_timezone(&tz).date_naive()
}

/// First instant of `date` in `tz`, as UTC. Falls back to the earliest valid
/// local time when midnight is skipped by a DST transition.
pub fn start_of_day(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let midnight = date.and_time(NaiveTime::MIN);
    match tz.from_local_datetime(&midnight).earliest() {
        Some(t) => t.with_timezone(&Utc),
        None => tz
            .from_local_datetime(&(midnight + Duration::hours(1)))
            .earliest()
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|| midnight.and_utc()),
    }
}

/// First instant after `date` ends in `tz`, as UTC.
pub fn end_of_day(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    match date.succ_opt() {
        Some(next) => start_of_day(next, tz),
        None => start_of_day(date, tz) + Duration::days(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_bounds_follow_timezone() {
        let tz: Tz = "Europe/Paris".parse().unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 7, 1).unwrap();

        let start = start_of_day(date, tz);
        let end = end_of_day(date, tz);

        assert_eq!(start.to_rfc3339(), "2026-06-30T22:00:00+00:00");
        assert_eq!(end - start, Duration::hours(24));
        assert_eq!(local_date(start, tz), date);
    }

    #[test]
    fn dst_day_is_short() {
        let tz: Tz = "Europe/Paris".parse().unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 3, 29).unwrap();

        assert_eq!(end_of_day(date, tz) - start_of_day(date, tz), Duration::hours(23));
    }

    #[test]
    fn manual_clock_advances() {
        let t0 = DateTime::<Utc>::from_timestamp(1_800_000_000, 0).unwrap();
        let clock = ManualClock::new(t0);
        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now() - t0, Duration::minutes(5));
    }

    #[test]
    fn ms_round_trip_rejects_out_of_range() {
        assert!(from_ms(i64::MAX).is_err());
    }
}
