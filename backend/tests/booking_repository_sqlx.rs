mod support;

use chrono::Duration;
use uuid::Uuid;

use agenda::booking::{
    AppointmentKind, Booking, BookingOutcome, BookingRepository, BookingStatus, CustomerInfo, EventRef, OutcomeKind,
    SqlxBookingRepository,
};

fn booking(n: u32, hour_offset: i64, customer: CustomerInfo) -> Booking {
    let starts_at = support::start_instant() + Duration::hours(hour_offset);
    Booking {
        booking_id: Uuid::new_v4(),
        owner_id: format!("owner-{}", n % 2),
        customer,
        staff_id: "alice".into(),
        kind: AppointmentKind::Consultation,
        starts_at,
        duration_min: 60,
        event: EventRef {
            calendar_id: "cal-alice".into(),
            event_id: format!("evt{n:08}"),
        },
        status: BookingStatus::Pending,
        rescheduled_to: None,
        created_ms: 1,
        updated_ms: 1,
    }
}

fn outcome(b: &Booking, kind: OutcomeKind) -> BookingOutcome {
    BookingOutcome {
        booking_id: b.booking_id,
        kind,
        recorded_ms: 10,
    }
}

#[tokio::test]
async fn insert_and_fetch() {
    let pool = support::setup_db().await;
    let repo = SqlxBookingRepository::new(pool);
    let b = booking(1, 1, support::customer(1));

    repo.insert(&b).await.unwrap();

    assert_eq!(repo.fetch_by_id(&b.booking_id).await.unwrap(), Some(b.clone()));
    assert_eq!(
        repo.fetch_by_event("cal-alice", "evt00000001").await.unwrap(),
        Some(b.clone())
    );
    assert!(repo.fetch_by_event("cal-bob", "evt00000001").await.unwrap().is_none());
    assert!(repo.fetch_by_id(&Uuid::new_v4()).await.unwrap().is_none());

    // one booking per event
    let mut dup = booking(1, 2, support::customer(2));
    dup.booking_id = Uuid::new_v4();
    assert!(repo.insert(&dup).await.is_err());
}

#[tokio::test]
async fn status_update_keeps_reschedule_link() {
    let pool = support::setup_db().await;
    let repo = SqlxBookingRepository::new(pool);
    let b = booking(1, 1, support::customer(1));
    repo.insert(&b).await.unwrap();

    let next = Uuid::new_v4();
    repo.update_status(&b.booking_id, BookingStatus::Rescheduled, Some(next), 5)
        .await
        .unwrap();
    repo.update_status(&b.booking_id, BookingStatus::Rescheduled, None, 6)
        .await
        .unwrap();

    let stored = repo.fetch_by_id(&b.booking_id).await.unwrap().unwrap();
    assert_eq!(stored.status, BookingStatus::Rescheduled);
    assert_eq!(stored.rescheduled_to, Some(next));
    assert_eq!(stored.updated_ms, 6);

    assert!(
        repo.update_status(&Uuid::new_v4(), BookingStatus::Attended, None, 7)
            .await
            .is_err()
    );
}

#[tokio::test]
async fn range_queries_are_half_open_and_ordered() {
    let pool = support::setup_db().await;
    let repo = SqlxBookingRepository::new(pool);
    let later = booking(1, 3, support::customer(1));
    let first = booking(2, 1, support::customer(2));
    let other_owner = booking(3, 2, support::customer(3));
    for b in [&later, &first, &other_owner] {
        repo.insert(b).await.unwrap();
    }

    let from = first.starts_at.timestamp_millis();
    let to = later.starts_at.timestamp_millis();

    let in_range = repo.fetch_in_range(from, to).await.unwrap();
    let ids: Vec<_> = in_range.iter().map(|b| b.booking_id).collect();
    assert_eq!(ids, vec![first.booking_id, other_owner.booking_id]);

    let mine = repo.fetch_by_owner_in_range("owner-0", from, to + 1).await.unwrap();
    assert_eq!(mine, vec![first]);
}

#[tokio::test]
async fn outcome_is_written_once() {
    let pool = support::setup_db().await;
    let repo = SqlxBookingRepository::new(pool);
    let b = booking(1, 1, support::customer(1));
    repo.insert(&b).await.unwrap();

    assert!(repo.insert_outcome(&outcome(&b, OutcomeKind::NoShow)).await.unwrap());
    assert!(!repo.insert_outcome(&outcome(&b, OutcomeKind::Attended)).await.unwrap());

    let stored = repo.fetch_outcome(&b.booking_id).await.unwrap().unwrap();
    assert_eq!(stored.kind, OutcomeKind::NoShow);
}

#[tokio::test]
async fn no_show_history_matches_name_or_contact() {
    let pool = support::setup_db().await;
    let repo = SqlxBookingRepository::new(pool);

    let past = booking(1, 1, CustomerInfo::new("Jane Doe", "jane@example.org"));
    let attended = booking(2, 2, CustomerInfo::new("Jane Doe", "jane@example.org"));
    let by_phone = booking(3, 3, CustomerInfo::new("Other Person", "+33 6 12 34 56 78"));
    for b in [&past, &attended, &by_phone] {
        repo.insert(b).await.unwrap();
    }
    repo.insert_outcome(&outcome(&past, OutcomeKind::NoShow)).await.unwrap();
    repo.insert_outcome(&outcome(&attended, OutcomeKind::Attended)).await.unwrap();
    repo.insert_outcome(&outcome(&by_phone, OutcomeKind::Ghost)).await.unwrap();

    let me = Uuid::new_v4();
    let by_name = CustomerInfo::new("  JANE  doe", "new@example.org");
    assert_eq!(repo.count_customer_no_shows(&by_name, &me).await.unwrap(), 1);

    let by_contact = CustomerInfo::new("Someone Else", "+33612345678");
    assert_eq!(repo.count_customer_no_shows(&by_contact, &me).await.unwrap(), 1);

    let stranger = CustomerInfo::new("New Customer", "new@example.org");
    assert_eq!(repo.count_customer_no_shows(&stranger, &me).await.unwrap(), 0);

    // a booking never counts against itself
    assert_eq!(
        repo.count_customer_no_shows(&past.customer, &past.booking_id)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn malformed_rows_are_skipped() {
    let pool = support::setup_db().await;
    let repo = SqlxBookingRepository::new(pool.clone());
    let good = booking(1, 1, support::customer(1));
    repo.insert(&good).await.unwrap();

    sqlx::query(
        r#"
INSERT INTO bookings (
  booking_id, owner_id, customer_name, customer_contact, name_key, contact_key,
  staff_id, kind, starts_ms, duration_min, calendar_id, event_id, status,
  rescheduled_to, created_ms, updated_ms
) VALUES (?, 'owner-1', 'X', 'x@example.org', 'x', 'x@example.org',
  'alice', 'consultation', ?, 60, 'cal-alice', 'evt-bad', 'teleported', NULL, 1, 1);
"#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(good.starts_at.timestamp_millis() + 1)
    .execute(&pool)
    .await
    .unwrap();

    let rows = repo.fetch_in_range(0, i64::MAX).await.unwrap();
    assert_eq!(rows, vec![good]);
    assert!(repo.fetch_by_event("cal-alice", "evt-bad").await.is_err());
}
