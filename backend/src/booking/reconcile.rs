use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::availability::occupancy::{SchedulingRules, holds_booking};
use crate::availability::roster::Roster;
use crate::booking::engine::rank_holders;
use crate::booking::model::{Booking, BookingStatus, EventRef};
use crate::booking::repository::BookingRepository;
use crate::calendar::{CalendarApi, CalendarError, CalendarEvent, list_events_for};
use crate::error::ReconcileError;
use crate::logger::warn_if_slow;
use crate::metrics::counters::{Counters, add, bump};
use crate::sync::tags::{extract_tag, status_from_color};
use crate::time::Clock;

const CALENDAR_BUDGET: StdDuration = StdDuration::from_millis(5000);

/// A slot holding more bookings than its capacity allows.
#[derive(Clone, Debug, PartialEq)]
pub struct OverCapacity {
    pub calendars: Vec<String>,
    pub starts_at: DateTime<Utc>,
    pub capacity: u32,
    /// Holders in first-come order; the ones past `capacity` are the excess.
    pub holders: Vec<EventRef>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Drift {
    pub booking_id: Uuid,
    pub local: BookingStatus,
    pub calendar: BookingStatus,
    /// The calendar status was copied into the local record.
    pub pulled: bool,
}

/// Inconsistencies between the calendar and the local records in one window.
/// Nothing listed here has been deleted.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReconcileReport {
    /// Owner-tagged events with no booking record.
    pub orphan_events: Vec<EventRef>,
    /// Bookings whose calendar event no longer exists.
    pub missing_events: Vec<Uuid>,
    pub over_capacity: Vec<OverCapacity>,
    pub drift: Vec<Drift>,
    /// Bookings whose event could not be checked this run.
    pub unchecked: Vec<Uuid>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.orphan_events.is_empty()
            && self.missing_events.is_empty()
            && self.over_capacity.is_empty()
            && self.drift.is_empty()
    }
}

/// Periodic audit of calendar events against booking records.
pub struct Reconciler {
    calendar: Arc<dyn CalendarApi>,
    repo: Arc<dyn BookingRepository>,
    roster: Arc<Roster>,
    rules: Arc<SchedulingRules>,
    clock: Arc<dyn Clock>,
    counters: Counters,
}

impl Reconciler {
    pub fn new(
        calendar: Arc<dyn CalendarApi>,
        repo: Arc<dyn BookingRepository>,
        roster: Arc<Roster>,
        rules: Arc<SchedulingRules>,
        clock: Arc<dyn Clock>,
        counters: Counters,
    ) -> Self {
        Self {
            calendar,
            repo,
            roster,
            rules,
            clock,
            counters,
        }
    }

    #[instrument(skip(self), target = "reconcile")]
    pub async fn run(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<ReconcileReport, ReconcileError> {
        let calendars = self.roster.all_calendar_ids();
        let events = warn_if_slow(
            "calendar_list_for_reconcile",
            CALENDAR_BUDGET,
            list_events_for(self.calendar.as_ref(), &calendars, from, to),
        )
        .await?;
        let bookings = self
            .repo
            .fetch_in_range(from.timestamp_millis(), to.timestamp_millis())
            .await
            .map_err(ReconcileError::Storage)?;

        let mut report = ReconcileReport::default();

        let by_event: HashMap<(&str, &str), &Booking> = bookings
            .iter()
            .map(|b| ((b.event.calendar_id.as_str(), b.event.event_id.as_str()), b))
            .collect();
        let mut seen: HashSet<Uuid> = HashSet::new();

        for ev in &events {
            if extract_tag(&ev.description).is_none() {
                continue;
            }
            let key = (ev.calendar_id.as_str(), ev.id.as_str());
            let booking = match by_event.get(&key) {
                Some(b) => Some((*b).clone()),
                // the record may start outside the window if the event was moved
                None => self
                    .repo
                    .fetch_by_event(&ev.calendar_id, &ev.id)
                    .await
                    .map_err(ReconcileError::Storage)?,
            };

            match booking {
                Some(b) => {
                    seen.insert(b.booking_id);
                    if let Some(d) = self.check_drift(&b, ev).await? {
                        report.drift.push(d);
                    }
                }
                None => {
                    warn!(calendar_id = %ev.calendar_id, event_id = %ev.id, "tagged event has no booking record");
                    report.orphan_events.push(EventRef {
                        calendar_id: ev.calendar_id.clone(),
                        event_id: ev.id.clone(),
                    });
                }
            }
        }

        for b in bookings.iter().filter(|b| !seen.contains(&b.booking_id)) {
            match self
                .calendar
                .get_event(&b.event.calendar_id, &b.event.event_id)
                .await
            {
                Ok(ev) => {
                    if let Some(d) = self.check_drift(b, &ev).await? {
                        report.drift.push(d);
                    }
                }
                Err(CalendarError::NotFound(_)) => {
                    warn!(booking_id = %b.booking_id, event_id = %b.event.event_id, "booking event is gone");
                    report.missing_events.push(b.booking_id);
                }
                Err(e) => {
                    bump(&self.counters.calendar_failures);
                    warn!(booking_id = %b.booking_id, error = %e, "could not check booking event");
                    report.unchecked.push(b.booking_id);
                }
            }
        }

        report.over_capacity = over_capacity(&events, &self.roster, &self.rules);

        add(&self.counters.reconcile_orphans, report.orphan_events.len() as u64);
        add(&self.counters.reconcile_missing, report.missing_events.len() as u64);
        info!(
            orphans = report.orphan_events.len(),
            missing = report.missing_events.len(),
            over_capacity = report.over_capacity.len(),
            drift = report.drift.len(),
            unchecked = report.unchecked.len(),
            "reconciliation finished"
        );
        Ok(report)
    }

    /// Compares the local status with the event's and pulls the calendar's
    /// when the move is a legal transition.
    async fn check_drift(
        &self,
        booking: &Booking,
        ev: &CalendarEvent,
    ) -> Result<Option<Drift>, ReconcileError> {
        let observed = status_from_color(ev.color, &ev.title);
        if observed == booking.status {
            return Ok(None);
        }

        let pulled = booking.status.can_transition_to(observed);
        if pulled {
            self.repo
                .update_status(
                    &booking.booking_id,
                    observed,
                    None,
                    self.clock.now().timestamp_millis(),
                )
                .await
                .map_err(ReconcileError::Storage)?;
        } else {
            warn!(
                booking_id = %booking.booking_id,
                local = %booking.status,
                calendar = %observed,
                "status drift cannot be pulled"
            );
        }

        Ok(Some(Drift {
            booking_id: booking.booking_id,
            local: booking.status,
            calendar: observed,
            pulled,
        }))
    }
}

/// Slots among `events` booked past their capacity. Events on calendars
/// outside the roster are ignored.
pub fn over_capacity(
    events: &[CalendarEvent],
    roster: &Roster,
    rules: &SchedulingRules,
) -> Vec<OverCapacity> {
    let mut groups: BTreeMap<(Vec<String>, DateTime<Utc>), (u32, DateTime<Utc>)> = BTreeMap::new();

    for ev in events.iter().filter(|e| holds_booking(e)) {
        let Some(member) = roster.by_calendar(&ev.calendar_id) else {
            continue;
        };
        let policy = rules.policy_for(member.role);
        let mut scope = policy.calendars_for(roster, member);
        scope.sort();
        let entry = groups
            .entry((scope, ev.start))
            .or_insert((policy.capacity, ev.end));
        entry.1 = entry.1.max(ev.end);
    }

    groups
        .into_iter()
        .filter_map(|((scope, start), (capacity, end))| {
            let holders = rank_holders(events, &scope, start, end);
            let same_start: Vec<EventRef> = holders
                .into_iter()
                .filter(|e| e.start == start)
                .map(|e| EventRef {
                    calendar_id: e.calendar_id.clone(),
                    event_id: e.id.clone(),
                })
                .collect();
            (same_start.len() > capacity as usize).then(|| OverCapacity {
                calendars: scope,
                starts_at: start,
                capacity,
                holders: same_start,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::availability::occupancy::{CapacityPolicy, CapacityScope};
    use crate::availability::roster::{Role, StaffMember};
    use crate::availability::template::{BlockedDates, WeeklyTemplate};
    use crate::calendar::EventColor;
    use chrono::Duration;

    fn rules(scope: CapacityScope) -> SchedulingRules {
        SchedulingRules {
            template: WeeklyTemplate::standard(),
            blocked: BlockedDates::default(),
            consultation: CapacityPolicy { capacity: 2, scope },
            coaching: CapacityPolicy::per_staff(1),
            timezone: chrono_tz::Europe::Paris,
            horizon_days: 60,
        }
    }

    fn roster() -> Roster {
        Roster::new(vec![
            StaffMember::new("alice", "cal-a", Role::Staff),
            StaffMember::new("bob", "cal-b", Role::Staff),
            StaffMember::new("cora", "cal-c", Role::Coach),
        ])
    }

    fn ev(id: &str, cal: &str, hour: i64, color: Option<EventColor>) -> CalendarEvent {
        let t0 = DateTime::<Utc>::from_timestamp(1_800_000_000, 0).unwrap() + Duration::hours(hour);
        CalendarEvent {
            id: id.into(),
            calendar_id: cal.into(),
            title: "Someone - Consultation".into(),
            description: "[Booked by: u1]".into(),
            color,
            start: t0,
            end: t0 + Duration::hours(1),
            created: Some(t0 - Duration::days(1) + Duration::seconds(id.len() as i64)),
        }
    }

    #[test]
    fn organization_scope_counts_across_calendars() {
        let events = vec![
            ev("a1", "cal-a", 0, None),
            ev("b1", "cal-b", 0, None),
            ev("b22", "cal-b", 0, None),
            ev("a2", "cal-a", 1, None),
        ];
        let found = over_capacity(&events, &roster(), &rules(CapacityScope::Organization));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].capacity, 2);
        assert_eq!(found[0].holders.len(), 3);
        assert_eq!(found[0].holders[2].event_id, "b22");

        let per_staff = over_capacity(&events, &roster(), &rules(CapacityScope::Staff));
        assert!(per_staff.is_empty());
    }

    #[test]
    fn released_and_foreign_events_do_not_count() {
        let mut personal = ev("x", "cal-a", 0, None);
        personal.description = "dentist".into();
        let events = vec![
            ev("c1", "cal-c", 0, None),
            ev("c2", "cal-c", 0, Some(EventColor::Graphite)),
            ev("z1", "cal-zzz", 0, None),
            ev("z2", "cal-zzz", 0, None),
            personal,
        ];
        assert!(over_capacity(&events, &roster(), &rules(CapacityScope::Staff)).is_empty());

        let crowded = vec![ev("c1", "cal-c", 0, None), ev("c22", "cal-c", 0, None)];
        let found = over_capacity(&crowded, &roster(), &rules(CapacityScope::Staff));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].calendars, vec!["cal-c".to_string()]);
    }
}
