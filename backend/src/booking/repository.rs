use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::booking::model::{Booking, BookingOutcome, BookingStatus, CustomerInfo};

/// Local mirror of bookings and their outcomes. The calendar stays the
/// source of truth; this store is an index plus the audit trail.
#[async_trait]
pub trait BookingRepository: Send + Sync {
    async fn insert(&self, booking: &Booking) -> Result<()>;

    async fn fetch_by_id(&self, booking_id: &Uuid) -> Result<Option<Booking>>;

    async fn fetch_by_event(&self, calendar_id: &str, event_id: &str) -> Result<Option<Booking>>;

    async fn update_status(
        &self,
        booking_id: &Uuid,
        status: BookingStatus,
        rescheduled_to: Option<Uuid>,
        updated_ms: i64,
    ) -> Result<()>;

    /// Bookings starting in `[from_ms, to_ms)`, ascending by start.
    async fn fetch_in_range(&self, from_ms: i64, to_ms: i64) -> Result<Vec<Booking>>;

    async fn fetch_by_owner_in_range(
        &self,
        owner_id: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<Booking>>;

    /// Returns `false` when an outcome for the booking already exists.
    async fn insert_outcome(&self, outcome: &BookingOutcome) -> Result<bool>;

    async fn fetch_outcome(&self, booking_id: &Uuid) -> Result<Option<BookingOutcome>>;

    /// No-show (or ghost) outcomes recorded for the same customer, matched by
    /// normalized name or contact, ignoring `excluding`.
    async fn count_customer_no_shows(&self, customer: &CustomerInfo, excluding: &Uuid)
    -> Result<u64>;
}
