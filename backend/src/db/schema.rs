use sqlx::AnyPool;

pub async fn migrate(pool: &AnyPool) -> anyhow::Result<()> {
    // Bookings (local mirror of calendar events)
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS bookings (
  booking_id TEXT PRIMARY KEY,
  owner_id TEXT NOT NULL,
  customer_name TEXT NOT NULL,
  customer_contact TEXT NOT NULL,
  name_key TEXT NOT NULL,
  contact_key TEXT NOT NULL,
  staff_id TEXT NOT NULL,
  kind TEXT NOT NULL,
  starts_ms BIGINT NOT NULL,
  duration_min BIGINT NOT NULL,
  calendar_id TEXT NOT NULL,
  event_id TEXT NOT NULL,
  status TEXT NOT NULL,
  rescheduled_to TEXT,
  created_ms BIGINT NOT NULL,
  updated_ms BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    // Outcomes, at most one per booking
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS booking_outcomes (
  booking_id TEXT PRIMARY KEY,
  kind TEXT NOT NULL,
  recorded_ms BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    // Bucket draw state (single versioned row per bucket)
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS bucket_state (
  bucket_id TEXT PRIMARY KEY,
  weights TEXT NOT NULL,
  draws BIGINT NOT NULL,
  version BIGINT NOT NULL,
  updated_ms BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_bookings_event ON bookings(calendar_id, event_id);"#)
        .execute(pool)
        .await?;

    sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_bookings_starts ON bookings(starts_ms);"#)
        .execute(pool)
        .await?;

    sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_bookings_owner ON bookings(owner_id, starts_ms);"#)
        .execute(pool)
        .await?;

    sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_bookings_customer ON bookings(name_key, contact_key);"#)
        .execute(pool)
        .await?;

    Ok(())
}
