use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::booking::model::{Booking, BookingStatus};
use crate::calendar::CalendarEvent;
use crate::sync::tags::status_from_color;

#[derive(Clone, Debug, PartialEq)]
pub struct BoardCard {
    pub booking_id: Uuid,
    pub customer_name: String,
    pub staff_id: String,
    pub starts_at: DateTime<Utc>,
    pub title: String,
    /// The calendar and the local record disagree on the status.
    pub drifted: bool,
}

/// Kanban view of one owner's bookings, one column per status.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Board {
    pub owner_id: String,
    pub columns: BTreeMap<BookingStatus, Vec<BoardCard>>,
    /// Bookings whose event was not found in the listing.
    pub missing: Vec<Uuid>,
}

impl Board {
    /// Columns follow the calendar; bookings without an event in `events`
    /// are listed under `missing` instead.
    pub fn build(owner_id: &str, bookings: &[Booking], events: &[CalendarEvent]) -> Self {
        let by_id: HashMap<(&str, &str), &CalendarEvent> = events
            .iter()
            .map(|e| ((e.calendar_id.as_str(), e.id.as_str()), e))
            .collect();

        let mut board = Board {
            owner_id: owner_id.to_string(),
            ..Board::default()
        };

        for b in bookings {
            let key = (b.event.calendar_id.as_str(), b.event.event_id.as_str());
            let Some(ev) = by_id.get(&key) else {
                board.missing.push(b.booking_id);
                continue;
            };
            let status = status_from_color(ev.color, &ev.title);
            board.columns.entry(status).or_default().push(BoardCard {
                booking_id: b.booking_id,
                customer_name: b.customer.name.clone(),
                staff_id: b.staff_id.clone(),
                starts_at: ev.start,
                title: ev.title.clone(),
                drifted: status != b.status,
            });
        }

        for cards in board.columns.values_mut() {
            cards.sort_by_key(|c| c.starts_at);
        }
        board
    }

    pub fn column(&self, status: BookingStatus) -> &[BoardCard] {
        self.columns.get(&status).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.columns.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booking::model::{AppointmentKind, CustomerInfo, EventRef};
    use crate::calendar::EventColor;
    use chrono::Duration;

    fn pair(n: u32, local: BookingStatus, color: Option<EventColor>, title: &str) -> (Booking, CalendarEvent) {
        let t0 = DateTime::<Utc>::from_timestamp(1_800_000_000, 0).unwrap() + Duration::hours(i64::from(n));
        let b = Booking {
            booking_id: Uuid::new_v4(),
            owner_id: "u1".into(),
            customer: CustomerInfo::new(format!("C{n}"), "c@example.org"),
            staff_id: "alice".into(),
            kind: AppointmentKind::Consultation,
            starts_at: t0,
            duration_min: 60,
            event: EventRef {
                calendar_id: "cal".into(),
                event_id: format!("e{n}"),
            },
            status: local,
            rescheduled_to: None,
            created_ms: 0,
            updated_ms: 0,
        };
        let e = CalendarEvent {
            id: format!("e{n}"),
            calendar_id: "cal".into(),
            title: title.into(),
            description: "[Booked by: u1]".into(),
            color,
            start: t0,
            end: t0 + Duration::hours(1),
            created: None,
        };
        (b, e)
    }

    #[test]
    fn columns_follow_calendar_colors() {
        let (b1, e1) = pair(1, BookingStatus::Pending, None, "C1");
        let (b2, e2) = pair(2, BookingStatus::Pending, Some(EventColor::Basil), "C2");
        let (b3, e3) = pair(3, BookingStatus::NoShow, Some(EventColor::Tomato), "C3 ( Ghost )");
        let (b4, _) = pair(4, BookingStatus::Pending, None, "C4");

        let board = Board::build("u1", &[b1, b2, b3, b4.clone()], &[e1, e2, e3]);

        assert_eq!(board.len(), 3);
        assert_eq!(board.column(BookingStatus::Pending).len(), 1);
        assert!(board.column(BookingStatus::Attended)[0].drifted);
        assert_eq!(board.column(BookingStatus::Ghost).len(), 1);
        assert!(board.column(BookingStatus::NoShow).is_empty());
        assert_eq!(board.missing, vec![b4.booking_id]);
    }
}
