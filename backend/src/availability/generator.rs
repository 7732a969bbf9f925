use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::{debug, instrument};

use crate::availability::occupancy::{SchedulingRules, assess};
use crate::availability::roster::{Roster, StaffMember};
use crate::availability::template::{DateRange, Window};
use crate::calendar::{CalendarApi, CalendarEvent, list_events_for};
use crate::error::AvailabilityError;
use crate::logger::warn_if_slow;
use crate::time::{Clock, end_of_day, local_date, start_of_day};

/// A bookable window for one staff member, in local time.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Slot {
    pub staff_id: String,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub duration_min: u32,
}

impl Slot {
    pub fn new(staff_id: impl Into<String>, date: NaiveDate, start: NaiveTime, duration_min: u32) -> Self {
        Self {
            staff_id: staff_id.into(),
            date,
            start,
            duration_min,
        }
    }

    /// UTC start of the slot. `None` when the local time does not exist
    /// (skipped by a DST transition); ambiguous times resolve to the earlier one.
    pub fn starts_at(&self, tz: Tz) -> Option<DateTime<Utc>> {
        tz.from_local_datetime(&self.date.and_time(self.start))
            .earliest()
            .map(|t| t.with_timezone(&Utc))
    }

    pub fn ends_at(&self, tz: Tz) -> Option<DateTime<Utc>> {
        self.starts_at(tz)
            .map(|t| t + Duration::minutes(i64::from(self.duration_min)))
    }
}

/// A slot together with its live remaining capacity when generated.
#[derive(Clone, Debug, PartialEq)]
pub struct AvailableSlot {
    pub slot: Slot,
    pub starts_at: DateTime<Utc>,
    pub remaining: u32,
}

/// Computes bookable slots from the weekly template, blocked dates and the
/// events already on the calendars.
pub struct AvailabilityGenerator {
    calendar: Arc<dyn CalendarApi>,
    roster: Arc<Roster>,
    rules: Arc<SchedulingRules>,
    clock: Arc<dyn Clock>,
}

impl AvailabilityGenerator {
    pub fn new(
        calendar: Arc<dyn CalendarApi>,
        roster: Arc<Roster>,
        rules: Arc<SchedulingRules>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            calendar,
            roster,
            rules,
            clock,
        }
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn rules(&self) -> &SchedulingRules {
        &self.rules
    }

    pub fn today(&self) -> NaiveDate {
        local_date(self.clock.now(), self.rules.timezone)
    }

    /// Last local date open for booking.
    pub fn horizon_end(&self) -> NaiveDate {
        self.today() + Duration::days(i64::from(self.rules.horizon_days))
    }

    /// The full bookable range, today through the horizon.
    pub fn horizon(&self) -> DateRange {
        DateRange::new(self.today(), self.horizon_end())
    }

    /// Slots for `staff_id` over `range`, ascending by start.
    ///
    /// Calendar events are fetched once up front; the returned sequence is
    /// computed lazily from that listing and can be restarted.
    #[instrument(skip(self), target = "availability", fields(staff_id = %staff_id))]
    pub async fn generate(
        &self,
        staff_id: &str,
        range: DateRange,
    ) -> Result<SlotSeq, AvailabilityError> {
        let member = self
            .roster
            .get(staff_id)
            .ok_or_else(|| AvailabilityError::UnknownStaff(staff_id.to_string()))?;

        if range.start > range.end {
            return Err(AvailabilityError::InvalidRange {
                start: range.start,
                end: range.end,
            });
        }
        if range.end > self.horizon_end() {
            return Err(AvailabilityError::HorizonExceeded(range.end));
        }

        let now = self.clock.now();
        let tz = self.rules.timezone;
        let policy = self.rules.policy_for(member.role);
        let scope = policy.calendars_for(&self.roster, member);

        let effective = DateRange::new(range.start.max(local_date(now, tz)), range.end);
        let events = if effective.start > effective.end {
            Vec::new()
        } else {
            warn_if_slow(
                "calendar_list_for_availability",
                StdDuration::from_millis(1500),
                list_events_for(
                    self.calendar.as_ref(),
                    &scope,
                    start_of_day(effective.start, tz),
                    end_of_day(effective.end, tz),
                ),
            )
            .await?
        };

        debug!(events = events.len(), calendars = scope.len(), "calendar events fetched");

        Ok(SlotSeq::new(Arc::new(SlotPlan {
            member: member.clone(),
            rules: self.rules.clone(),
            scope,
            capacity: policy.capacity,
            events,
            now,
            range: effective,
        })))
    }
}

/// Everything needed to evaluate slots without further I/O.
#[derive(Debug)]
struct SlotPlan {
    member: StaffMember,
    rules: Arc<SchedulingRules>,
    scope: Vec<String>,
    capacity: u32,
    events: Vec<CalendarEvent>,
    now: DateTime<Utc>,
    range: DateRange,
}

impl SlotPlan {
    fn windows_on(&self, date: NaiveDate) -> Vec<Window> {
        if self.rules.blocked.contains(date) {
            return Vec::new();
        }
        self.member
            .windows_for(&self.rules.template, date.weekday())
    }

    fn evaluate(&self, date: NaiveDate, w: Window) -> Option<AvailableSlot> {
        let slot = Slot::new(self.member.id.clone(), date, w.start, w.duration_min);
        let starts_at = slot.starts_at(self.rules.timezone)?;
        if starts_at <= self.now {
            return None;
        }
        let ends_at = starts_at + Duration::minutes(i64::from(w.duration_min));

        let remaining = assess(
            &self.events,
            &self.member.calendar_id,
            &self.scope,
            starts_at,
            ends_at,
        )
        .remaining(self.capacity);

        (remaining > 0).then_some(AvailableSlot {
            slot,
            starts_at,
            remaining,
        })
    }
}

/// Lazy, finite sequence of available slots. A clone continues from the same
/// position; `restart` starts a fresh pass over the same listing.
#[derive(Clone, Debug)]
pub struct SlotSeq {
    plan: Arc<SlotPlan>,
    day: Option<NaiveDate>,
    windows: Vec<Window>,
    idx: usize,
}

impl SlotSeq {
    fn new(plan: Arc<SlotPlan>) -> Self {
        let day = (plan.range.start <= plan.range.end).then_some(plan.range.start);
        let windows = day.map(|d| plan.windows_on(d)).unwrap_or_default();
        Self {
            plan,
            day,
            windows,
            idx: 0,
        }
    }

    /// A new sequence from the first slot, over the same calendar listing.
    pub fn restart(&self) -> Self {
        Self::new(self.plan.clone())
    }

    pub fn range(&self) -> DateRange {
        self.plan.range
    }
}

impl Iterator for SlotSeq {
    type Item = AvailableSlot;

    fn next(&mut self) -> Option<AvailableSlot> {
        loop {
            let day = self.day?;

            if self.idx >= self.windows.len() {
                self.day = day.succ_opt().filter(|d| *d <= self.plan.range.end);
                self.windows = self.day.map(|d| self.plan.windows_on(d)).unwrap_or_default();
                self.idx = 0;
                continue;
            }

            let w = self.windows[self.idx];
            self.idx += 1;
            if let Some(s) = self.plan.evaluate(day, w) {
                return Some(s);
            }
        }
    }
}
