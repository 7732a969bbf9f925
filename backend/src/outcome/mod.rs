pub mod tracker;

pub use tracker::{Deferral, OutcomeTracker, ScanReport};
