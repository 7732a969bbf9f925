use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use tracing::{info, instrument, warn};

use crate::availability::generator::Slot;
use crate::availability::roster::Role;
use crate::booking::engine::BookingEngine;
use crate::booking::model::{Booking, CustomerInfo};
use crate::bucket::engine::BucketDrawEngine;
use crate::error::{BookingError, CoachingError, ValidationErrors};
use crate::sync::tags::OwnerTag;

/// Books coaching appointments: the coach comes from the bucket draw, the
/// appointment goes on that coach's calendar.
pub struct CoachingDesk {
    bucket: Arc<BucketDrawEngine>,
    engine: Arc<BookingEngine>,
}

impl CoachingDesk {
    pub fn new(bucket: Arc<BucketDrawEngine>, engine: Arc<BookingEngine>) -> Self {
        Self { bucket, engine }
    }

    /// A draw is spent even when the booking then fails: the bucket tracks
    /// assignments handed out, not appointments kept.
    #[instrument(skip(self, customer), target = "booking", fields(%date, %start))]
    pub async fn book(
        &self,
        date: NaiveDate,
        start: NaiveTime,
        duration_min: u32,
        customer: CustomerInfo,
        owner_id: &str,
    ) -> Result<Booking, CoachingError> {
        let tag = OwnerTag::for_owner(owner_id).ok_or_else(|| CoachingError::Booking {
            coach_id: String::new(),
            source: BookingError::Validation(ValidationErrors::single(
                "owner_id",
                "must be non-empty, single-line and free of ']'",
            )),
        })?;

        let draw = self.bucket.draw().await?;
        let coach_id = draw.resource_id;

        let roster = self.engine.availability().generator().roster();
        match roster.get(&coach_id) {
            Some(m) if m.role == Role::Coach => {}
            _ => {
                warn!(coach_id = %coach_id, "drawn resource has no coach calendar");
                return Err(CoachingError::UnknownCoach(coach_id));
            }
        }

        let slot = Slot::new(coach_id.clone(), date, start, duration_min);
        match self.engine.book_tagged(&slot, customer, &tag, None).await {
            Ok(b) => {
                info!(coach_id = %coach_id, booking_id = %b.booking_id, "coaching booked");
                Ok(b)
            }
            Err(source) => Err(CoachingError::Booking { coach_id, source }),
        }
    }
}
