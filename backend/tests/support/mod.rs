#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use sqlx::AnyPool;
use sqlx::any::AnyPoolOptions;
use uuid::Uuid;

use agenda::availability::{
    AvailabilityGenerator, AvailabilityService, BlockedDates, CapacityPolicy, CapacityScope, Role, Roster,
    SchedulingRules, Slot, StaffMember, WeeklyTemplate,
};
use agenda::booking::{BookingEngine, BookingRepository, CustomerInfo, Reconciler, SqlxBookingRepository};
use agenda::calendar::MemoryCalendar;
use agenda::metrics::counters::Counters;
use agenda::outcome::OutcomeTracker;
use agenda::sync::StatusSynchronizer;
use agenda::time::ManualClock;

/// Isolated, uniquely named in-memory SQLite database with the schema
/// applied. A single connection keeps writers from tripping over the shared
/// cache's table locks.
pub async fn setup_db() -> AnyPool {
    sqlx::any::install_default_drivers();

    let db_name = Uuid::new_v4().to_string();
    let conn_str = format!("sqlite:file:{}?mode=memory&cache=shared", db_name);

    let pool = AnyPoolOptions::new()
        .max_connections(1)
        .connect(&conn_str)
        .await
        .unwrap();

    agenda::db::schema::migrate(&pool).await.unwrap();
    pool
}

pub fn tz() -> Tz {
    chrono_tz::Europe::Paris
}

/// Monday 2026-10-19, 08:00 in Paris.
pub fn start_instant() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-10-19T08:00:00+02:00")
        .unwrap()
        .with_timezone(&Utc)
}

pub fn monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
}

pub fn day(offset: u64) -> NaiveDate {
    monday().checked_add_days(Days::new(offset)).unwrap()
}

pub fn at(hour: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, 0, 0).unwrap()
}

pub fn slot(staff_id: &str, offset: u64, hour: u32) -> Slot {
    Slot::new(staff_id, day(offset), at(hour), 60)
}

pub fn customer(n: u32) -> CustomerInfo {
    CustomerInfo::new(format!("Customer Number{n}"), format!("customer{n}@example.org"))
}

/// Every service wired against one memory calendar, one sqlite database
/// and a manual clock.
pub struct Harness {
    pub pool: AnyPool,
    pub calendar: Arc<MemoryCalendar>,
    pub clock: Arc<ManualClock>,
    pub counters: Counters,
    pub repo: Arc<SqlxBookingRepository>,
    pub roster: Arc<Roster>,
    pub rules: Arc<SchedulingRules>,
    pub availability: Arc<AvailabilityService>,
    pub engine: Arc<BookingEngine>,
    pub sync: Arc<StatusSynchronizer>,
    pub tracker: OutcomeTracker,
    pub reconciler: Reconciler,
}

impl Harness {
    pub async fn new(capacity: u32, scope: CapacityScope) -> Self {
        Self::with_grace(capacity, scope, chrono::Duration::zero()).await
    }

    pub async fn with_grace(capacity: u32, scope: CapacityScope, grace: chrono::Duration) -> Self {
        Self::build(capacity, scope, grace, |repo| repo as Arc<dyn BookingRepository>).await
    }

    /// Services see the repository returned by `wrap`; `Harness::repo`
    /// stays the plain sqlite one for assertions.
    pub async fn with_repo(
        capacity: u32,
        scope: CapacityScope,
        wrap: impl FnOnce(Arc<SqlxBookingRepository>) -> Arc<dyn BookingRepository>,
    ) -> Self {
        Self::build(capacity, scope, chrono::Duration::zero(), wrap).await
    }

    async fn build(
        capacity: u32,
        scope: CapacityScope,
        grace: chrono::Duration,
        wrap: impl FnOnce(Arc<SqlxBookingRepository>) -> Arc<dyn BookingRepository>,
    ) -> Self {
        let pool = setup_db().await;
        let calendar = Arc::new(MemoryCalendar::new(2));
        let clock = Arc::new(ManualClock::new(start_instant()));
        let counters = Counters::default();
        let repo = Arc::new(SqlxBookingRepository::new(pool.clone()));
        let services_repo = wrap(repo.clone());

        let roster = Arc::new(Roster::new(vec![
            StaffMember::new("alice", "cal-alice", Role::Staff),
            StaffMember::new("bob", "cal-bob", Role::Staff),
            StaffMember::new("A", "cal-coach-a", Role::Coach),
            StaffMember::new("B", "cal-coach-b", Role::Coach),
            StaffMember::new("C", "cal-coach-c", Role::Coach),
        ]));
        let rules = Arc::new(SchedulingRules {
            template: WeeklyTemplate::standard(),
            blocked: BlockedDates::new([day(3)]),
            consultation: CapacityPolicy { capacity, scope },
            coaching: CapacityPolicy::per_staff(1),
            timezone: tz(),
            horizon_days: 30,
        });

        let generator = Arc::new(AvailabilityGenerator::new(
            calendar.clone(),
            roster.clone(),
            rules.clone(),
            clock.clone(),
        ));
        let availability = Arc::new(AvailabilityService::new(generator, clock.clone(), counters.clone()));
        let engine = Arc::new(BookingEngine::new(
            calendar.clone(),
            services_repo.clone(),
            availability.clone(),
            clock.clone(),
            counters.clone(),
        ));
        let sync = Arc::new(StatusSynchronizer::new(
            calendar.clone(),
            services_repo.clone(),
            engine.clone(),
            clock.clone(),
            counters.clone(),
        ));
        let tracker = OutcomeTracker::new(
            calendar.clone(),
            services_repo.clone(),
            sync.clone(),
            clock.clone(),
            tz(),
            grace,
            counters.clone(),
        );
        let reconciler = Reconciler::new(
            calendar.clone(),
            services_repo.clone(),
            roster.clone(),
            rules.clone(),
            clock.clone(),
            counters.clone(),
        );

        Self {
            pool,
            calendar,
            clock,
            counters,
            repo,
            roster,
            rules,
            availability,
            engine,
            sync,
            tracker,
            reconciler,
        }
    }

    /// A second booking engine sharing the calendar and database but not the
    /// in-process slot locks, as another instance of the service would.
    pub fn second_instance(&self) -> Arc<BookingEngine> {
        Arc::new(BookingEngine::new(
            self.calendar.clone(),
            self.repo.clone(),
            self.availability.clone(),
            self.clock.clone(),
            Counters::default(),
        ))
    }
}
