pub mod coaching;
pub mod engine;
pub mod model;
pub mod reconcile;
pub mod repository;
pub mod repository_sqlx;
pub mod validation;

pub use coaching::CoachingDesk;
pub use engine::BookingEngine;
pub use model::{
    AppointmentKind, Booking, BookingId, BookingOutcome, BookingStatus, CustomerInfo, EventRef,
    OutcomeKind,
};
pub use reconcile::{Drift, OverCapacity, ReconcileReport, Reconciler};
pub use repository::BookingRepository;
pub use repository_sqlx::SqlxBookingRepository;
