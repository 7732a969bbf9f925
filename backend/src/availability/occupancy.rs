use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::availability::roster::{Role, Roster, StaffMember};
use crate::availability::template::{BlockedDates, WeeklyTemplate};
use crate::calendar::CalendarEvent;
use crate::sync::tags::{extract_tag, status_from_color};

/// Which calendars share one slot's capacity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapacityScope {
    /// Bookings across every staff calendar at the same time count together.
    Organization,
    /// Each member's calendar has its own capacity.
    Staff,
}

impl FromStr for CapacityScope {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "organization" | "org" => Ok(CapacityScope::Organization),
            "staff" => Ok(CapacityScope::Staff),
            other => Err(anyhow::anyhow!("Invalid CapacityScope value: {}", other)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CapacityPolicy {
    pub capacity: u32,
    pub scope: CapacityScope,
}

impl CapacityPolicy {
    pub fn per_staff(capacity: u32) -> Self {
        Self {
            capacity,
            scope: CapacityScope::Staff,
        }
    }

    /// Calendars whose bookings compete with `member`'s slots.
    pub fn calendars_for(&self, roster: &Roster, member: &StaffMember) -> Vec<String> {
        match self.scope {
            CapacityScope::Staff => vec![member.calendar_id.clone()],
            CapacityScope::Organization => {
                let mut ids = roster.calendar_ids(member.role);
                if !ids.contains(&member.calendar_id) {
                    ids.push(member.calendar_id.clone());
                }
                ids
            }
        }
    }
}

/// Scheduling rules shared by the availability generator and the booking
/// engine, so both judge a slot the same way.
#[derive(Clone, Debug)]
pub struct SchedulingRules {
    pub template: WeeklyTemplate,
    pub blocked: BlockedDates,
    /// Capacity for consultation slots on staff calendars.
    pub consultation: CapacityPolicy,
    /// Capacity for coaching slots on coach calendars.
    pub coaching: CapacityPolicy,
    pub timezone: Tz,
    pub horizon_days: u32,
}

impl SchedulingRules {
    pub fn policy_for(&self, role: Role) -> CapacityPolicy {
        match role {
            Role::Staff => self.consultation,
            Role::Coach => self.coaching,
        }
    }
}

/// Live usage of one time window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Occupancy {
    /// An untagged (personal) event covers the window on the member's own calendar.
    pub blocked: bool,
    /// Tagged bookings in scope still holding capacity.
    pub booked: u32,
}

impl Occupancy {
    pub fn remaining(&self, capacity: u32) -> u32 {
        if self.blocked {
            0
        } else {
            capacity.saturating_sub(self.booked)
        }
    }
}

/// Whether `ev` is an owner-tagged booking that still holds its slot.
pub fn holds_booking(ev: &CalendarEvent) -> bool {
    extract_tag(&ev.description).is_some()
        && status_from_color(ev.color, &ev.title).holds_capacity()
}

/// Measures `[start, end)` against `events`. `scope` lists the calendars
/// sharing capacity; `own_calendar` is the member whose personal events
/// block the window outright.
pub fn assess(
    events: &[CalendarEvent],
    own_calendar: &str,
    scope: &[String],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Occupancy {
    let mut occ = Occupancy::default();

    for ev in events.iter().filter(|e| e.overlaps(start, end)) {
        if extract_tag(&ev.description).is_none() {
            if ev.calendar_id == own_calendar {
                occ.blocked = true;
            }
            continue;
        }
        if scope.contains(&ev.calendar_id) && holds_booking(ev) {
            occ.booked += 1;
        }
    }

    occ
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::EventColor;
    use chrono::Duration;

    fn t(h: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_800_000_000 + h * 3600, 0).unwrap()
    }

    fn ev(cal: &str, h: i64, description: &str, color: Option<EventColor>) -> CalendarEvent {
        CalendarEvent {
            id: format!("{cal}-{h}-{description}"),
            calendar_id: cal.into(),
            title: "x".into(),
            description: description.into(),
            color,
            start: t(h),
            end: t(h) + Duration::hours(1),
            created: None,
        }
    }

    #[test]
    fn tagged_events_count_untagged_own_events_block() {
        let scope = vec!["a".to_string(), "b".to_string()];
        let events = vec![
            ev("a", 10, "[Booked by: u1]", None),
            ev("b", 10, "[Booked by: u2]", None),
            ev("b", 10, "lunch", None),
            ev("c", 10, "[Booked by: u3]", None),
            ev("a", 11, "[Booked by: u4]", None),
        ];

        let occ = assess(&events, "a", &scope, t(10), t(11));
        assert_eq!(occ, Occupancy { blocked: false, booked: 2 });
        assert_eq!(occ.remaining(3), 1);

        let occ = assess(&events, "b", &scope, t(10), t(11));
        assert!(occ.blocked);
        assert_eq!(occ.remaining(3), 0);
    }

    #[test]
    fn released_bookings_free_capacity() {
        let scope = vec!["a".to_string()];
        let events = vec![
            ev("a", 10, "[Booked by: u1]", Some(EventColor::Tangerine)),
            ev("a", 10, "[Booked by: u2]", Some(EventColor::Graphite)),
            ev("a", 10, "[Booked by: u3]", Some(EventColor::Basil)),
        ];
        let occ = assess(&events, "a", &scope, t(10), t(11));
        assert_eq!(occ.booked, 1);
    }

    #[test]
    fn org_scope_includes_role_peers() {
        let roster = Roster::new(vec![
            StaffMember::new("a", "cal-a", Role::Staff),
            StaffMember::new("b", "cal-b", Role::Staff),
            StaffMember::new("x", "cal-x", Role::Coach),
        ]);
        let org = CapacityPolicy {
            capacity: 3,
            scope: CapacityScope::Organization,
        };
        let a = roster.get("a").unwrap();
        assert_eq!(org.calendars_for(&roster, a), vec!["cal-a", "cal-b"]);
        assert_eq!(CapacityPolicy::per_staff(1).calendars_for(&roster, a), vec!["cal-a"]);
        assert_eq!("ORG".parse::<CapacityScope>().unwrap(), CapacityScope::Organization);
    }
}
