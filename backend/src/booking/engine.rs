use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Datelike, Duration, Utc};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::availability::generator::Slot;
use crate::availability::occupancy::{assess, holds_booking};
use crate::availability::roster::{Role, StaffMember};
use crate::availability::service::AvailabilityService;
use crate::availability::template::Window;
use crate::booking::model::{AppointmentKind, Booking, BookingStatus, CustomerInfo, EventRef};
use crate::booking::repository::BookingRepository;
use crate::booking::validation::validate_request;
use crate::calendar::{CalendarApi, CalendarError, CalendarEvent, EventColor, NewEvent, list_events_for};
use crate::error::{BookingError, ValidationErrors};
use crate::locks::KeyedLocks;
use crate::logger::{annotate_span, warn_if_slow};
use crate::metrics::counters::{Counters, bump};
use crate::sync::tags::{OwnerTag, color_from_status, embed_tag};
use crate::time::Clock;

const CALENDAR_BUDGET: StdDuration = StdDuration::from_millis(1500);
const DB_BUDGET: StdDuration = StdDuration::from_millis(100);

/// Accepts booking requests and turns them into calendar events plus local
/// records.
///
/// Capacity is checked against the live calendar under a per-slot lock, and
/// audited again after the event exists to catch writers outside this
/// process. A slot lock covers every calendar sharing the slot's capacity.
pub struct BookingEngine {
    calendar: Arc<dyn CalendarApi>,
    repo: Arc<dyn BookingRepository>,
    availability: Arc<AvailabilityService>,
    clock: Arc<dyn Clock>,
    counters: Counters,
    slot_locks: KeyedLocks<String>,
}

/// A slot resolved against the roster and the scheduling rules.
struct ResolvedSlot<'a> {
    member: &'a StaffMember,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
    capacity: u32,
    scope: Vec<String>,
}

impl BookingEngine {
    pub fn new(
        calendar: Arc<dyn CalendarApi>,
        repo: Arc<dyn BookingRepository>,
        availability: Arc<AvailabilityService>,
        clock: Arc<dyn Clock>,
        counters: Counters,
    ) -> Self {
        Self {
            calendar,
            repo,
            availability,
            clock,
            counters,
            slot_locks: KeyedLocks::new(),
        }
    }

    pub fn availability(&self) -> &AvailabilityService {
        &self.availability
    }

    /// Books `slot` for `customer` on behalf of `owner_id`.
    pub async fn book(
        &self,
        slot: &Slot,
        customer: CustomerInfo,
        owner_id: &str,
    ) -> Result<Booking, BookingError> {
        let tag = OwnerTag::for_owner(owner_id).ok_or_else(|| {
            ValidationErrors::single("owner_id", "must be non-empty, single-line and free of ']'")
        })?;
        self.book_tagged(slot, customer, &tag, None).await
    }

    /// Books with an existing owner tag, copied byte for byte into the new
    /// event. `note` leads the event description.
    #[instrument(
        skip(self, customer, tag, note),
        target = "booking",
        fields(staff_id = %slot.staff_id, date = %slot.date, start = %slot.start, owner_id, booking_id)
    )]
    pub async fn book_tagged(
        &self,
        slot: &Slot,
        customer: CustomerInfo,
        tag: &OwnerTag,
        note: Option<&str>,
    ) -> Result<Booking, BookingError> {
        validate_request(slot, &customer, tag.owner_id(), note)?;
        let resolved = self.resolve(slot)?;
        let kind = match resolved.member.role {
            Role::Staff => AppointmentKind::Consultation,
            Role::Coach => AppointmentKind::Coaching,
        };

        let lock_key = format!(
            "{}@{}",
            resolved.scope.join(","),
            resolved.starts_at.timestamp_millis()
        );
        let guard = self.slot_locks.lock(lock_key).await;

        let events = self.live_events(&resolved).await?;
        let occ = assess(
            &events,
            &resolved.member.calendar_id,
            &resolved.scope,
            resolved.starts_at,
            resolved.ends_at,
        );
        if occ.blocked {
            return Err(BookingError::SlotBlocked(format!(
                "{} has a conflicting event at {}",
                resolved.member.id, resolved.starts_at
            )));
        }
        if occ.remaining(resolved.capacity) == 0 {
            bump(&self.counters.bookings_rejected_full);
            return Err(BookingError::SlotFull {
                starts_at: resolved.starts_at,
                capacity: resolved.capacity,
                booked: occ.booked,
            });
        }

        let new_event = NewEvent {
            title: format!("{} - {}", customer.name.trim(), kind.label()),
            description: embed_tag(note.unwrap_or_default(), tag),
            start: resolved.starts_at,
            end: resolved.ends_at,
            color: color_from_status(BookingStatus::Pending),
        };
        let event_id = warn_if_slow(
            "calendar_create_event",
            CALENDAR_BUDGET,
            self.calendar
                .create_event(&resolved.member.calendar_id, &new_event),
        )
        .await
        .map_err(|e| self.upstream(e))?;

        let now_ms = self.clock.now().timestamp_millis();
        let booking = Booking {
            booking_id: Uuid::new_v4(),
            owner_id: tag.owner_id().to_string(),
            customer,
            staff_id: resolved.member.id.clone(),
            kind,
            starts_at: resolved.starts_at,
            duration_min: slot.duration_min,
            event: EventRef {
                calendar_id: resolved.member.calendar_id.clone(),
                event_id: event_id.clone(),
            },
            status: BookingStatus::Pending,
            rescheduled_to: None,
            created_ms: now_ms,
            updated_ms: now_ms,
        };
        annotate_span(&booking.owner_id, &booking.booking_id);

        if let Some(ahead) = self.audit_capacity(&resolved, &event_id).await {
            return Err(self.reject_over_capacity(&resolved, booking, ahead).await);
        }

        let persisted = warn_if_slow("db_insert_booking", DB_BUDGET, self.repo.insert(&booking)).await;
        drop(guard);

        if let Err(e) = persisted {
            bump(&self.counters.bookings_unrecorded);
            error!(
                error = %e,
                event_id = %event_id,
                "calendar event created but booking not persisted; left for reconciliation"
            );
            return Err(BookingError::Unrecorded {
                event_id,
                source: e,
            });
        }

        self.availability
            .invalidate(&booking.staff_id, slot.date);
        bump(&self.counters.bookings_created);
        info!(event_id = %booking.event.event_id, "booking created");

        Ok(booking)
    }

    fn resolve<'a>(&'a self, slot: &Slot) -> Result<ResolvedSlot<'a>, BookingError> {
        let generator = self.availability.generator();
        let rules = generator.rules();
        let member = generator
            .roster()
            .get(&slot.staff_id)
            .ok_or_else(|| BookingError::UnknownStaff(slot.staff_id.clone()))?;

        if rules.blocked.contains(slot.date) {
            return Err(BookingError::SlotBlocked(format!("{} is a blocked date", slot.date)));
        }

        let offered = member
            .windows_for(&rules.template, slot.date.weekday())
            .contains(&Window::new(slot.start, slot.duration_min));
        if !offered {
            return Err(BookingError::SlotBlocked(format!(
                "{} offers no {}-minute window at {} on {}",
                member.id, slot.duration_min, slot.start, slot.date
            )));
        }

        let starts_at = slot.starts_at(rules.timezone).ok_or_else(|| {
            BookingError::SlotBlocked(format!("{} {} does not exist locally", slot.date, slot.start))
        })?;
        if starts_at <= self.clock.now() {
            return Err(BookingError::SlotBlocked(format!("{starts_at} is in the past")));
        }
        if slot.date > generator.horizon_end() {
            return Err(BookingError::SlotBlocked(format!(
                "{} is beyond the booking horizon",
                slot.date
            )));
        }

        let policy = rules.policy_for(member.role);
        Ok(ResolvedSlot {
            member,
            starts_at,
            ends_at: starts_at + Duration::minutes(i64::from(slot.duration_min)),
            capacity: policy.capacity,
            scope: policy.calendars_for(generator.roster(), member),
        })
    }

    async fn live_events(&self, r: &ResolvedSlot<'_>) -> Result<Vec<CalendarEvent>, BookingError> {
        warn_if_slow(
            "calendar_list_for_booking",
            CALENDAR_BUDGET,
            list_events_for(self.calendar.as_ref(), &r.scope, r.starts_at, r.ends_at),
        )
        .await
        .map_err(|e| self.upstream(e))
    }

    /// Re-reads the slot after creating `event_id` and returns how many
    /// bookings rank ahead of it when it is past capacity.
    async fn audit_capacity(&self, r: &ResolvedSlot<'_>, event_id: &str) -> Option<u32> {
        let events = match self.live_events(r).await {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "post-commit capacity audit skipped");
                return None;
            }
        };

        let holders = rank_holders(&events, &r.scope, r.starts_at, r.ends_at);
        let Some(pos) = holders.iter().position(|e| e.id == event_id) else {
            warn!(event_id, "created event missing from audit listing");
            return None;
        };

        let pos = u32::try_from(pos).unwrap_or(u32::MAX);
        (pos >= r.capacity).then_some(pos)
    }

    async fn reject_over_capacity(
        &self,
        r: &ResolvedSlot<'_>,
        mut booking: Booking,
        ahead: u32,
    ) -> BookingError {
        bump(&self.counters.bookings_audit_cancelled);
        warn!(
            event_id = %booking.event.event_id,
            ahead,
            capacity = r.capacity,
            "slot over capacity after commit; releasing booking"
        );

        let recolored = self
            .calendar
            .set_color(
                &booking.event.calendar_id,
                &booking.event.event_id,
                Some(EventColor::Graphite),
            )
            .await;

        match recolored {
            Ok(()) => {
                booking.status = BookingStatus::Cancelled;
                if let Err(e) = self.repo.insert(&booking).await {
                    error!(error = %e, "could not record released booking");
                }
            }
            Err(e) => {
                bump(&self.counters.calendar_failures);
                error!(
                    error = %e,
                    event_id = %booking.event.event_id,
                    "could not release over-capacity event; left for reconciliation"
                );
            }
        }

        BookingError::SlotFull {
            starts_at: r.starts_at,
            capacity: r.capacity,
            booked: ahead,
        }
    }

    fn upstream(&self, e: CalendarError) -> BookingError {
        bump(&self.counters.calendar_failures);
        BookingError::CalendarUnavailable(e)
    }
}

/// Tagged events in `scope` holding capacity over `[start, end)`, in
/// first-come order: creation time, then event id.
pub fn rank_holders<'a>(
    events: &'a [CalendarEvent],
    scope: &[String],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<&'a CalendarEvent> {
    let mut holders: Vec<&CalendarEvent> = events
        .iter()
        .filter(|e| scope.contains(&e.calendar_id) && e.overlaps(start, end) && holds_booking(e))
        .collect();
    holders.sort_by(|a, b| {
        (a.created.is_none(), a.created, &a.id).cmp(&(b.created.is_none(), b.created, &b.id))
    });
    holders
}
