use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use futures::future::join_all;
use tracing::{error, info, instrument, warn};

use crate::availability::cache::AvailabilityCache;
use crate::availability::generator::{AvailabilityGenerator, AvailableSlot};
use crate::availability::occupancy::CapacityScope;
use crate::availability::template::DateRange;
use crate::error::AvailabilityError;
use crate::metrics::counters::{Counters, bump};
use crate::time::Clock;

/// What callers see when they ask for a member's availability.
#[derive(Clone, Debug, PartialEq)]
pub struct AvailabilitySnapshot {
    pub staff_id: String,
    pub slots: Vec<AvailableSlot>,
    pub generated_at: DateTime<Utc>,
    /// The last refresh failed; slots are from an older generation.
    pub stale: bool,
}

#[derive(Debug, Default)]
pub struct RefreshReport {
    pub refreshed: Vec<String>,
    pub failed: Vec<(String, AvailabilityError)>,
}

/// Owns the availability cache: refreshes it on schedule, serves reads and
/// applies invalidations from bookings.
pub struct AvailabilityService {
    generator: Arc<AvailabilityGenerator>,
    cache: AvailabilityCache,
    clock: Arc<dyn Clock>,
    counters: Counters,
}

impl AvailabilityService {
    pub fn new(generator: Arc<AvailabilityGenerator>, clock: Arc<dyn Clock>, counters: Counters) -> Self {
        Self {
            generator,
            cache: AvailabilityCache::new(),
            clock,
            counters,
        }
    }

    pub fn generator(&self) -> &AvailabilityGenerator {
        &self.generator
    }

    pub fn cache(&self) -> &AvailabilityCache {
        &self.cache
    }

    /// Refreshes every roster member concurrently. One member's failure does
    /// not hold back the others.
    #[instrument(skip(self), target = "availability")]
    pub async fn refresh_all(&self) -> RefreshReport {
        let ids: Vec<String> = self
            .generator
            .roster()
            .members()
            .iter()
            .map(|m| m.id.clone())
            .collect();

        let results = join_all(ids.iter().map(|id| self.refresh_staff(id))).await;

        let mut report = RefreshReport::default();
        for (id, res) in ids.into_iter().zip(results) {
            match res {
                Ok(()) => report.refreshed.push(id),
                Err(e) => report.failed.push((id, e)),
            }
        }

        info!(
            refreshed = report.refreshed.len(),
            failed = report.failed.len(),
            "availability refresh finished"
        );
        report
    }

    /// Regenerates the whole horizon for one member. On failure the previous
    /// snapshot is kept and flagged stale.
    #[instrument(skip(self), target = "availability", fields(staff_id = %staff_id))]
    pub async fn refresh_staff(&self, staff_id: &str) -> Result<(), AvailabilityError> {
        let range = self.generator.horizon();
        let generated_at = self.clock.now();
        let mark = self.cache.generation_mark();

        match self.generator.generate(staff_id, range).await {
            Ok(seq) => {
                let slots: Vec<AvailableSlot> = seq.collect();
                self.cache.store(staff_id, range, slots, generated_at, mark);
                bump(&self.counters.availability_refreshes);
                Ok(())
            }
            Err(e) => {
                if let AvailabilityError::Calendar(_) = &e {
                    bump(&self.counters.calendar_failures);
                }
                if self.cache.mark_stale(staff_id) {
                    bump(&self.counters.availability_stale);
                    warn!(error = %e, "refresh failed; serving previous snapshot as stale");
                } else {
                    error!(error = %e, "refresh failed and no previous snapshot exists");
                }
                Err(e)
            }
        }
    }

    /// Cached availability for `staff_id`, with invalidated dates regenerated
    /// first and past slots dropped.
    #[instrument(skip(self), target = "availability", fields(staff_id = %staff_id))]
    pub async fn snapshot(&self, staff_id: &str) -> Result<AvailabilitySnapshot, AvailabilityError> {
        if self.generator.roster().get(staff_id).is_none() {
            return Err(AvailabilityError::UnknownStaff(staff_id.to_string()));
        }
        let Some(entry) = self.cache.get(staff_id) else {
            return Err(AvailabilityError::NotReady(staff_id.to_string()));
        };

        if !entry.invalidated.is_empty() {
            self.regenerate_dates(staff_id, &entry.invalidated).await;
        }

        let entry = self
            .cache
            .get(staff_id)
            .ok_or_else(|| AvailabilityError::NotReady(staff_id.to_string()))?;
        let now = self.clock.now();

        Ok(AvailabilitySnapshot {
            staff_id: entry.staff_id,
            slots: entry
                .slots
                .into_iter()
                .filter(|s| s.starts_at > now)
                .collect(),
            generated_at: entry.generated_at,
            stale: entry.stale,
        })
    }

    async fn regenerate_dates(&self, staff_id: &str, seen: &BTreeMap<NaiveDate, u64>) {
        let (Some(first), Some(last)) = (seen.keys().next(), seen.keys().next_back()) else {
            return;
        };
        let horizon = self.generator.horizon();
        let range = DateRange::new((*first).max(horizon.start), (*last).min(horizon.end));
        if range.start > range.end {
            // every invalidated date has fallen outside the horizon
            self.cache.replace_dates(staff_id, seen, Vec::new());
            return;
        }

        match self.generator.generate(staff_id, range).await {
            Ok(seq) => {
                self.cache.replace_dates(staff_id, seen, seq.collect());
            }
            Err(e) => {
                bump(&self.counters.calendar_failures);
                self.cache.mark_stale(staff_id);
                warn!(error = %e, dates = seen.len(), "could not regenerate invalidated dates");
            }
        }
    }

    /// Marks `date` for regeneration for every member whose capacity a
    /// booking on `staff_id` affects.
    pub fn invalidate(&self, staff_id: &str, date: NaiveDate) {
        let roster = self.generator.roster();
        let Some(member) = roster.get(staff_id) else {
            return;
        };

        match self.generator.rules().policy_for(member.role).scope {
            CapacityScope::Staff => self.cache.invalidate(staff_id, date),
            CapacityScope::Organization => {
                for peer in roster.with_role(member.role) {
                    self.cache.invalidate(&peer.id, date);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::availability::occupancy::{CapacityPolicy, SchedulingRules};
    use crate::availability::roster::{Role, Roster, StaffMember};
    use crate::availability::template::{BlockedDates, WeeklyTemplate};
    use crate::calendar::{
        CalendarApi, CalendarError, CalendarEvent, CalendarOp, EventPage, EventPatch, MemoryCalendar, NewEvent,
    };
    use crate::time::ManualClock;
    use async_trait::async_trait;
    use chrono::Duration;
    use chrono_tz::Tz;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::{Notify, Semaphore};

    /// Listings taken while armed are held back until `release`, so a
    /// refresh can be caught between reading the calendar and storing.
    struct GatedCalendar {
        inner: Arc<MemoryCalendar>,
        armed: AtomicBool,
        entered: Notify,
        gate: Semaphore,
    }

    impl GatedCalendar {
        fn new(inner: Arc<MemoryCalendar>) -> Self {
            Self {
                inner,
                armed: AtomicBool::new(false),
                entered: Notify::new(),
                gate: Semaphore::new(0),
            }
        }

        fn arm(&self) {
            self.armed.store(true, Ordering::SeqCst);
        }

        fn release(&self) {
            self.armed.store(false, Ordering::SeqCst);
            self.gate.add_permits(1);
        }
    }

    #[async_trait]
    impl CalendarApi for GatedCalendar {
        async fn list_events(
            &self,
            calendar_id: &str,
            time_min: DateTime<Utc>,
            time_max: DateTime<Utc>,
            page_token: Option<&str>,
        ) -> Result<EventPage, CalendarError> {
            let page = self.inner.list_events(calendar_id, time_min, time_max, page_token).await;
            if self.armed.load(Ordering::SeqCst) {
                self.entered.notify_one();
                let _permit = self.gate.acquire().await;
            }
            page
        }

        async fn get_event(&self, calendar_id: &str, event_id: &str) -> Result<CalendarEvent, CalendarError> {
            self.inner.get_event(calendar_id, event_id).await
        }

        async fn create_event(&self, calendar_id: &str, event: &NewEvent) -> Result<String, CalendarError> {
            self.inner.create_event(calendar_id, event).await
        }

        async fn update_event(
            &self,
            calendar_id: &str,
            event_id: &str,
            patch: &EventPatch,
        ) -> Result<(), CalendarError> {
            self.inner.update_event(calendar_id, event_id, patch).await
        }
    }

    fn setup() -> (Arc<MemoryCalendar>, Arc<ManualClock>, AvailabilityService) {
        let cal = Arc::new(MemoryCalendar::default());
        let (clock, svc) = service_on(cal.clone());
        (cal, clock, svc)
    }

    fn service_on(cal: Arc<dyn CalendarApi>) -> (Arc<ManualClock>, AvailabilityService) {
        let tz: Tz = "Europe/Paris".parse().unwrap();
        let clock = Arc::new(ManualClock::new(
            DateTime::parse_from_rfc3339("2026-10-19T08:00:00+02:00")
                .unwrap()
                .with_timezone(&Utc),
        ));
        let roster = Roster::new(vec![
            StaffMember::new("alice", "cal-alice", Role::Staff),
            StaffMember::new("bob", "cal-bob", Role::Staff),
        ]);
        let rules = SchedulingRules {
            template: WeeklyTemplate::standard(),
            blocked: BlockedDates::default(),
            consultation: CapacityPolicy {
                capacity: 1,
                scope: CapacityScope::Organization,
            },
            coaching: CapacityPolicy::per_staff(1),
            timezone: tz,
            horizon_days: 6,
        };
        let generator = Arc::new(AvailabilityGenerator::new(
            cal,
            Arc::new(roster),
            Arc::new(rules),
            clock.clone(),
        ));
        let svc = AvailabilityService::new(generator, clock.clone(), Counters::default());
        (clock, svc)
    }

    #[tokio::test]
    async fn not_ready_before_first_refresh() {
        let (_, _, svc) = setup();
        assert!(matches!(
            svc.snapshot("alice").await,
            Err(AvailabilityError::NotReady(_))
        ));
        assert!(matches!(
            svc.snapshot("nobody").await,
            Err(AvailabilityError::UnknownStaff(_))
        ));
    }

    #[tokio::test]
    async fn outage_keeps_last_good_snapshot_marked_stale() {
        let (cal, _, svc) = setup();
        let report = svc.refresh_all().await;
        assert_eq!(report.refreshed.len(), 2);

        let before = svc.snapshot("alice").await.unwrap();
        assert!(!before.stale);
        assert_eq!(before.slots.len(), 30);

        cal.set_offline(true);
        let report = svc.refresh_all().await;
        assert_eq!(report.failed.len(), 2);

        let after = svc.snapshot("alice").await.unwrap();
        assert!(after.stale);
        assert_eq!(after.slots, before.slots);
    }

    #[tokio::test]
    async fn invalidation_regenerates_only_touched_dates_for_peers() {
        let (cal, _, svc) = setup();
        svc.refresh_all().await;
        let lists_after_refresh = cal.call_count(CalendarOp::List);

        let first = svc.snapshot("alice").await.unwrap().slots[0].clone();
        cal.insert_event(
            "cal-bob",
            NewEvent {
                title: "x".into(),
                description: "[Booked by: u1]".into(),
                start: first.starts_at,
                end: first.starts_at + Duration::hours(1),
                color: None,
            },
        );

        // Without invalidation the cache is served as-is.
        assert_eq!(svc.snapshot("alice").await.unwrap().slots[0], first);

        svc.invalidate("bob", first.slot.date);
        let alice = svc.snapshot("alice").await.unwrap();
        assert_ne!(alice.slots[0].starts_at, first.starts_at);
        assert_eq!(alice.slots.len(), 29);
        assert!(cal.call_count(CalendarOp::List) > lists_after_refresh);
        assert!(svc.cache().get("alice").unwrap().invalidated.is_empty());
    }

    #[tokio::test]
    async fn past_slots_drop_out_of_snapshots() {
        let (_, clock, svc) = setup();
        svc.refresh_all().await;
        clock.advance(Duration::hours(3));
        // 08:00 + 3h = 11:00 local; 09:00, 10:00 and 11:00 are gone.
        assert_eq!(svc.snapshot("alice").await.unwrap().slots.len(), 27);
    }

    #[tokio::test]
    async fn booking_during_a_refresh_is_not_lost() {
        let mem = Arc::new(MemoryCalendar::default());
        let gated = Arc::new(GatedCalendar::new(mem.clone()));
        let (_, svc) = service_on(gated.clone());
        let svc = Arc::new(svc);
        svc.refresh_staff("alice").await.unwrap();
        let first = svc.snapshot("alice").await.unwrap().slots[0].clone();

        gated.arm();
        let refresh = tokio::spawn({
            let svc = svc.clone();
            async move { svc.refresh_staff("alice").await }
        });
        gated.entered.notified().await;

        // the slot fills while the refresh holds an older listing
        mem.insert_event(
            "cal-alice",
            NewEvent {
                title: "x".into(),
                description: "[Booked by: u1]".into(),
                start: first.starts_at,
                end: first.starts_at + Duration::hours(1),
                color: None,
            },
        );
        svc.invalidate("alice", first.slot.date);
        gated.release();
        refresh.await.unwrap().unwrap();

        let alice = svc.snapshot("alice").await.unwrap();
        assert_ne!(alice.slots[0].starts_at, first.starts_at);
        assert!(svc.cache().get("alice").unwrap().invalidated.is_empty());
    }
}
