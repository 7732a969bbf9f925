use std::sync::Arc;

use anyhow::Context;
use chrono::Days;
use clap::Parser;

use agenda::{
    availability::{AvailabilityGenerator, AvailabilityService},
    booking::{BookingEngine, Reconciler, SqlxBookingRepository},
    bucket::{BucketDrawEngine, SqlxBucketRepository},
    calendar::{CalendarApi, HttpCalendarClient, MemoryCalendar},
    cli::{Cli, Command},
    config::AppConfig,
    db::Db,
    jobs::{self, DailySchedule},
    logger::{LogFormat, TraceId, init_tracing, root_span},
    metrics::counters::Counters,
    outcome::OutcomeTracker,
    sync::StatusSynchronizer,
    time::{Clock, SystemClock, local_date},
};
use tracing::Instrument;

/// Every long-lived service, wired once.
struct App {
    availability: Arc<AvailabilityService>,
    tracker: Arc<OutcomeTracker>,
    reconciler: Arc<Reconciler>,
    bucket: Arc<BucketDrawEngine>,
    clock: Arc<dyn Clock>,
}

fn calendar_from(cfg: &AppConfig) -> anyhow::Result<Arc<dyn CalendarApi>> {
    match cfg.http_calendar() {
        Some(http) => {
            tracing::info!(base = %http.base_url, "using remote calendar");
            Ok(Arc::new(HttpCalendarClient::new(http)?))
        }
        None => {
            tracing::warn!("CALENDAR_API_BASE not set; using the in-process calendar");
            Ok(Arc::new(MemoryCalendar::new(cfg.calendar_page_size)))
        }
    }
}

/// Connects and migrates the database, then builds the services on top of
/// it and the calendar.
async fn init_app(cfg: &AppConfig) -> anyhow::Result<App> {
    let db = Db::open(&cfg.database_url, cfg.database_max_connections).await?;

    let counters = Counters::default();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let calendar = calendar_from(cfg)?;

    let booking_repo = Arc::new(SqlxBookingRepository::new((*db.pool).clone()));
    let bucket_repo = Arc::new(SqlxBucketRepository::new((*db.pool).clone()));

    let roster = Arc::new(cfg.roster.clone());
    let rules = Arc::new(cfg.scheduling_rules());

    let generator = Arc::new(AvailabilityGenerator::new(
        calendar.clone(),
        roster.clone(),
        rules.clone(),
        clock.clone(),
    ));
    let availability = Arc::new(AvailabilityService::new(generator, clock.clone(), counters.clone()));

    let engine = Arc::new(BookingEngine::new(
        calendar.clone(),
        booking_repo.clone(),
        availability.clone(),
        clock.clone(),
        counters.clone(),
    ));
    let sync = Arc::new(StatusSynchronizer::new(
        calendar.clone(),
        booking_repo.clone(),
        engine,
        clock.clone(),
        counters.clone(),
    ));
    let tracker = Arc::new(OutcomeTracker::new(
        calendar.clone(),
        booking_repo.clone(),
        sync,
        clock.clone(),
        cfg.timezone,
        cfg.no_show_grace,
        counters.clone(),
    ));
    let reconciler = Arc::new(Reconciler::new(
        calendar,
        booking_repo,
        roster,
        rules,
        clock.clone(),
        counters.clone(),
    ));
    let bucket = Arc::new(BucketDrawEngine::new(bucket_repo, cfg.bucket.clone(), counters));

    Ok(App {
        availability,
        tracker,
        reconciler,
        bucket,
        clock,
    })
}

/// Days the outcome scan looks back so the grace period never hides a day.
fn scan_days_back(cfg: &AppConfig) -> u32 {
    let grace_days = (cfg.no_show_grace.num_hours().max(0) + 23) / 24;
    1 + u32::try_from(grace_days).unwrap_or(u32::MAX - 1)
}

async fn serve(app: App, cfg: &AppConfig) -> anyhow::Result<()> {
    let handles = [
        jobs::start_availability_refresh_loop(
            app.availability.clone(),
            DailySchedule::new(cfg.availability_refresh_times.clone(), cfg.timezone),
            app.clock.clone(),
        ),
        jobs::start_outcome_scan_loop(
            app.tracker.clone(),
            DailySchedule::new(vec![cfg.outcome_scan_time], cfg.timezone),
            app.clock.clone(),
            scan_days_back(cfg),
        ),
        jobs::start_reconcile_loop(
            app.reconciler.clone(),
            cfg.reconcile_interval,
            app.clock.clone(),
            cfg.timezone,
            cfg.reconcile_lookback_days,
            cfg.booking_horizon_days,
        ),
    ];

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    for h in handles {
        h.abort();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(LogFormat::for_app_env(std::env::var("APP_ENV").ok().as_deref()));

    let cli = Cli::parse();
    let cfg = AppConfig::from_env().context("invalid configuration")?;
    let app = init_app(&cfg).await?;

    match cli.command() {
        Command::Serve => {
            tracing::info!(
                staff = cfg.roster.members().len(),
                timezone = %cfg.timezone,
                "Starting agenda service..."
            );
            serve(app, &cfg).await?;
        }

        Command::Refresh => {
            let span = root_span("cli_refresh", &TraceId::random());
            let report = app.availability.refresh_all().instrument(span).await;
            println!("refreshed: {}", report.refreshed.join(", "));
            for (staff_id, e) in &report.failed {
                println!("failed: {staff_id}: {e}");
            }
        }

        Command::Scan { date } => {
            let date = match date {
                Some(d) => d,
                None => local_date(app.clock.now(), cfg.timezone)
                    .checked_sub_days(Days::new(1))
                    .context("no previous day")?,
            };
            let span = root_span("cli_scan", &TraceId::random());
            let report = app.tracker.scan(date).instrument(span).await?;
            for o in &report.outcomes {
                println!("{} {}", o.booking_id, o.kind.as_str());
            }
            for (id, why) in &report.deferred {
                println!("{id} deferred: {why:?}");
            }
        }

        Command::Reconcile => {
            let (from, to) = jobs::reconcile_window(
                app.clock.now(),
                cfg.timezone,
                cfg.reconcile_lookback_days,
                cfg.booking_horizon_days,
            );
            let span = root_span("cli_reconcile", &TraceId::random());
            let report = app.reconciler.run(from, to).instrument(span).await?;
            for e in &report.orphan_events {
                println!("orphan event: {} / {}", e.calendar_id, e.event_id);
            }
            for id in &report.missing_events {
                println!("missing event for booking {id}");
            }
            for o in &report.over_capacity {
                println!(
                    "over capacity at {}: {} holders for {} places",
                    o.starts_at,
                    o.holders.len(),
                    o.capacity
                );
            }
            for d in &report.drift {
                println!(
                    "drift on {}: local {} calendar {} (pulled: {})",
                    d.booking_id, d.local, d.calendar, d.pulled
                );
            }
            if report.is_clean() {
                println!("calendar and records agree");
            }
        }

        Command::Draw { reset } => {
            if reset {
                let state = app.bucket.reset().await?;
                println!("bucket reset: {:?}", state.weights);
            } else {
                let draw = app.bucket.draw().await?;
                println!("{}", draw.resource_id);
            }
        }
    }

    Ok(())
}
