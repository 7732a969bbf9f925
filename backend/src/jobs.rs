//! Background jobs: availability refresh at fixed local times, the daily
//! outcome scan and the periodic reconciliation audit. Every run gets its
//! own root span and trace id.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Days, NaiveTime, Utc};
use chrono_tz::Tz;
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, warn};

use crate::availability::service::AvailabilityService;
use crate::booking::reconcile::Reconciler;
use crate::logger::{TraceId, root_span};
use crate::outcome::tracker::OutcomeTracker;
use crate::time::{Clock, local_date, start_of_day};

/// A set of local wall-clock times repeated every day.
#[derive(Clone, Debug, PartialEq)]
pub struct DailySchedule {
    times: Vec<NaiveTime>,
    timezone: Tz,
}

impl DailySchedule {
    pub fn new(mut times: Vec<NaiveTime>, timezone: Tz) -> Self {
        times.sort();
        times.dedup();
        Self { times, timezone }
    }

    pub fn times(&self) -> &[NaiveTime] {
        &self.times
    }

    /// First scheduled instant strictly after `now`. A time that falls in a
    /// DST gap runs at the earliest valid instant after it; an ambiguous one
    /// runs once, at its first occurrence.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let today = local_date(now, self.timezone);
        (0..=2u64)
            .filter_map(|d| today.checked_add_days(Days::new(d)))
            .flat_map(|date| {
                self.times.iter().filter_map(move |t| {
                    let local = date.and_time(*t);
                    local
                        .and_local_timezone(self.timezone)
                        .earliest()
                        .or_else(|| {
                            // skipped by a DST jump: move forward an hour
                            (local + chrono::Duration::hours(1))
                                .and_local_timezone(self.timezone)
                                .earliest()
                        })
                        .map(|dt| dt.with_timezone(&Utc))
                })
            })
            .find(|at| *at > now)
    }
}

async fn sleep_until(clock: &dyn Clock, at: DateTime<Utc>) {
    let wait = (at - clock.now()).to_std().unwrap_or(StdDuration::ZERO);
    tokio::time::sleep(wait).await;
}

/// Refreshes every staff member once right away, then at each scheduled
/// time.
pub fn start_availability_refresh_loop(
    service: Arc<AvailabilityService>,
    schedule: DailySchedule,
    clock: Arc<dyn Clock>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let span = root_span("availability_refresh", &TraceId::random());
            async {
                let report = service.refresh_all().await;
                for (staff_id, e) in &report.failed {
                    warn!(%staff_id, error = %e, "availability refresh failed; serving stale slots");
                }
                info!(
                    refreshed = report.refreshed.len(),
                    failed = report.failed.len(),
                    "availability refresh run"
                );
            }
            .instrument(span)
            .await;

            let Some(next) = schedule.next_after(clock.now()) else {
                error!("availability refresh schedule is empty; loop stopped");
                return;
            };
            sleep_until(clock.as_ref(), next).await;
        }
    })
}

/// Scans the local days from `days_back` days ago up to today at each
/// scheduled time. Re-scanning a day is harmless, so a day missed while the
/// service was down is picked up by the next run.
pub fn start_outcome_scan_loop(
    tracker: Arc<OutcomeTracker>,
    schedule: DailySchedule,
    clock: Arc<dyn Clock>,
    days_back: u32,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Some(next) = schedule.next_after(clock.now()) else {
                error!("outcome scan schedule is empty; loop stopped");
                return;
            };
            sleep_until(clock.as_ref(), next).await;

            let span = root_span("outcome_scan", &TraceId::random());
            async {
                let today = local_date(clock.now(), schedule.timezone);
                for back in (0..=u64::from(days_back)).rev() {
                    let Some(date) = today.checked_sub_days(Days::new(back)) else {
                        continue;
                    };
                    match tracker.scan(date).await {
                        Ok(report) => info!(
                            %date,
                            outcomes = report.outcomes.len(),
                            deferred = report.deferred.len(),
                            "outcome scan"
                        ),
                        Err(e) => error!(%date, error = %e, "outcome scan failed"),
                    }
                }
            }
            .instrument(span)
            .await;
        }
    })
}

/// Window one reconciliation run audits: `lookback_days` before today up
/// to the end of the booking horizon.
pub fn reconcile_window(
    now: DateTime<Utc>,
    timezone: Tz,
    lookback_days: u32,
    horizon_days: u32,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let today = local_date(now, timezone);
    let from = today
        .checked_sub_days(Days::new(u64::from(lookback_days)))
        .unwrap_or(today);
    let to = today
        .checked_add_days(Days::new(u64::from(horizon_days) + 1))
        .unwrap_or(today);
    (start_of_day(from, timezone), start_of_day(to, timezone))
}

pub fn start_reconcile_loop(
    reconciler: Arc<Reconciler>,
    every: StdDuration,
    clock: Arc<dyn Clock>,
    timezone: Tz,
    lookback_days: u32,
    horizon_days: u32,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let span = root_span("reconcile", &TraceId::random());
            async {
                let (from, to) = reconcile_window(clock.now(), timezone, lookback_days, horizon_days);
                match reconciler.run(from, to).await {
                    Ok(report) if report.is_clean() => info!("calendar and records agree"),
                    Ok(report) => warn!(
                        orphans = ?report.orphan_events,
                        missing = ?report.missing_events,
                        over_capacity = report.over_capacity.len(),
                        drift = report.drift.len(),
                        "reconciliation found inconsistencies"
                    ),
                    Err(e) => error!(error = %e, "reconciliation failed"),
                }
            }
            .instrument(span)
            .await;
        }
    })
}
