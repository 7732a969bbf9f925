use anyhow::{Context, anyhow};
use async_trait::async_trait;
use sqlx::{AnyPool, Row};
use uuid::Uuid;

use crate::booking::model::{
    Booking, BookingOutcome, BookingStatus, CustomerInfo, EventRef, OutcomeKind,
};
use crate::booking::repository::BookingRepository;
use crate::time::from_ms;

/// SQLx-backed implementation of BookingRepository.
/// Responsible only for persistence and row mapping.
pub struct SqlxBookingRepository {
    pool: AnyPool,
}

impl SqlxBookingRepository {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }
}

const BOOKING_COLUMNS: &str = r#"
  booking_id, owner_id, customer_name, customer_contact,
  staff_id, kind, starts_ms, duration_min,
  calendar_id, event_id, status, rescheduled_to,
  created_ms, updated_ms
"#;

#[async_trait]
impl BookingRepository for SqlxBookingRepository {
    async fn insert(&self, b: &Booking) -> anyhow::Result<()> {
        sqlx::query(
            r#"
INSERT INTO bookings (
  booking_id, owner_id, customer_name, customer_contact,
  name_key, contact_key,
  staff_id, kind, starts_ms, duration_min,
  calendar_id, event_id, status, rescheduled_to,
  created_ms, updated_ms
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);
"#,
        )
        .bind(b.booking_id.to_string())
        .bind(b.owner_id.clone())
        .bind(b.customer.name.clone())
        .bind(b.customer.contact.clone())
        .bind(b.customer.name_key())
        .bind(b.customer.contact_key())
        .bind(b.staff_id.clone())
        .bind(b.kind.as_str())
        .bind(b.starts_at.timestamp_millis())
        .bind(i64::from(b.duration_min))
        .bind(b.event.calendar_id.clone())
        .bind(b.event.event_id.clone())
        .bind(b.status.as_str())
        .bind(b.rescheduled_to.map(|id| id.to_string()))
        .bind(b.created_ms)
        .bind(b.updated_ms)
        .execute(&self.pool)
        .await
        .context("insert booking")?;

        Ok(())
    }

    async fn fetch_by_id(&self, booking_id: &Uuid) -> anyhow::Result<Option<Booking>> {
        let row = sqlx::query(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE booking_id = ?;"
        ))
        .bind(booking_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(row_to_booking(&r)?)),
            None => Ok(None),
        }
    }

    async fn fetch_by_event(
        &self,
        calendar_id: &str,
        event_id: &str,
    ) -> anyhow::Result<Option<Booking>> {
        let row = sqlx::query(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE calendar_id = ? AND event_id = ?;"
        ))
        .bind(calendar_id.to_string())
        .bind(event_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(row_to_booking(&r)?)),
            None => Ok(None),
        }
    }

    async fn update_status(
        &self,
        booking_id: &Uuid,
        status: BookingStatus,
        rescheduled_to: Option<Uuid>,
        updated_ms: i64,
    ) -> anyhow::Result<()> {
        let res = sqlx::query(
            r#"
UPDATE bookings
SET status = ?, rescheduled_to = COALESCE(?, rescheduled_to), updated_ms = ?
WHERE booking_id = ?;
"#,
        )
        .bind(status.as_str())
        .bind(rescheduled_to.map(|id| id.to_string()))
        .bind(updated_ms)
        .bind(booking_id.to_string())
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(anyhow!("booking not found: {booking_id}"));
        }
        Ok(())
    }

    async fn fetch_in_range(&self, from_ms: i64, to_ms: i64) -> anyhow::Result<Vec<Booking>> {
        let rows = sqlx::query(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE starts_ms >= ? AND starts_ms < ? ORDER BY starts_ms, booking_id;"
        ))
        .bind(from_ms)
        .bind(to_ms)
        .fetch_all(&self.pool)
        .await?;

        Ok(map_rows(rows))
    }

    async fn fetch_by_owner_in_range(
        &self,
        owner_id: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> anyhow::Result<Vec<Booking>> {
        let rows = sqlx::query(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE owner_id = ? AND starts_ms >= ? AND starts_ms < ? ORDER BY starts_ms, booking_id;"
        ))
        .bind(owner_id.to_string())
        .bind(from_ms)
        .bind(to_ms)
        .fetch_all(&self.pool)
        .await?;

        Ok(map_rows(rows))
    }

    async fn insert_outcome(&self, o: &BookingOutcome) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
INSERT INTO booking_outcomes (booking_id, kind, recorded_ms)
VALUES (?, ?, ?)
ON CONFLICT (booking_id) DO NOTHING;
"#,
        )
        .bind(o.booking_id.to_string())
        .bind(o.kind.as_str())
        .bind(o.recorded_ms)
        .execute(&self.pool)
        .await
        .context("insert outcome")?;

        Ok(res.rows_affected() == 1)
    }

    async fn fetch_outcome(&self, booking_id: &Uuid) -> anyhow::Result<Option<BookingOutcome>> {
        let row = sqlx::query(
            r#"SELECT booking_id, kind, recorded_ms FROM booking_outcomes WHERE booking_id = ?;"#,
        )
        .bind(booking_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(BookingOutcome {
                booking_id: parse_uuid(&r, "booking_id")?,
                kind: r.get::<String, _>("kind").parse()?,
                recorded_ms: r.get::<i64, _>("recorded_ms"),
            })),
            None => Ok(None),
        }
    }

    async fn count_customer_no_shows(
        &self,
        customer: &CustomerInfo,
        excluding: &Uuid,
    ) -> anyhow::Result<u64> {
        let row = sqlx::query(
            r#"
SELECT COUNT(*) AS n
FROM booking_outcomes o
JOIN bookings b ON b.booking_id = o.booking_id
WHERE o.kind IN (?, ?)
  AND b.booking_id <> ?
  AND (b.name_key = ? OR (b.contact_key <> '' AND b.contact_key = ?));
"#,
        )
        .bind(OutcomeKind::NoShow.as_str())
        .bind(OutcomeKind::Ghost.as_str())
        .bind(excluding.to_string())
        .bind(customer.name_key())
        .bind(customer.contact_key())
        .fetch_one(&self.pool)
        .await?;

        let n: i64 = row.get("n");
        u64::try_from(n).map_err(|_| anyhow!("negative count: {n}"))
    }
}

/* =========================
Row mapping + conversions
========================= */

fn map_rows(rows: Vec<sqlx::any::AnyRow>) -> Vec<Booking> {
    let mut out = Vec::with_capacity(rows.len());
    for r in rows {
        match row_to_booking(&r) {
            Ok(b) => out.push(b),
            Err(e) => {
                // poison-row resilience: skip but don't fail the page
                tracing::warn!(error = %e, "skipping malformed booking row");
            }
        }
    }
    out
}

fn parse_uuid(r: &sqlx::any::AnyRow, col: &str) -> anyhow::Result<Uuid> {
    let s: String = r.get(col);
    Uuid::parse_str(&s).with_context(|| format!("invalid {col}"))
}

fn row_to_booking(r: &sqlx::any::AnyRow) -> anyhow::Result<Booking> {
    let rescheduled_to = r
        .get::<Option<String>, _>("rescheduled_to")
        .map(|s| Uuid::parse_str(&s))
        .transpose()
        .context("invalid rescheduled_to")?;

    Ok(Booking {
        booking_id: parse_uuid(r, "booking_id")?,
        owner_id: r.get("owner_id"),
        customer: CustomerInfo {
            name: r.get("customer_name"),
            contact: r.get("customer_contact"),
        },
        staff_id: r.get("staff_id"),
        kind: r.get::<String, _>("kind").parse()?,
        starts_at: from_ms(r.get("starts_ms"))?,
        duration_min: i64_to_u32(r.get("duration_min"))?,
        event: EventRef {
            calendar_id: r.get("calendar_id"),
            event_id: r.get("event_id"),
        },
        status: r.get::<String, _>("status").parse()?,
        rescheduled_to,
        created_ms: r.get("created_ms"),
        updated_ms: r.get("updated_ms"),
    })
}

/* =========================
Numeric safety helpers
========================= */

fn i64_to_u32(v: i64) -> anyhow::Result<u32> {
    u32::try_from(v).map_err(|_| anyhow!("out of range for u32: {v}"))
}
