pub mod cache;
pub mod generator;
pub mod occupancy;
pub mod roster;
pub mod service;
pub mod template;

pub use generator::{AvailabilityGenerator, AvailableSlot, Slot, SlotSeq};
pub use occupancy::{CapacityPolicy, CapacityScope, Occupancy, SchedulingRules};
pub use roster::{Role, Roster, StaffMember};
pub use service::{AvailabilityService, AvailabilitySnapshot, RefreshReport};
pub use template::{BlockedDates, DateRange, WeeklyTemplate, Window};
