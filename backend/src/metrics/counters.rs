use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Minimal counters for operational visibility.
#[derive(Clone, Default)]
pub struct Counters {
    pub availability_refreshes: Arc<AtomicU64>,
    pub availability_stale: Arc<AtomicU64>,

    pub bookings_created: Arc<AtomicU64>,
    pub bookings_rejected_full: Arc<AtomicU64>,
    // over capacity after the event was created
    pub bookings_audit_cancelled: Arc<AtomicU64>,
    pub bookings_unrecorded: Arc<AtomicU64>,

    pub calendar_failures: Arc<AtomicU64>,

    pub status_writes: Arc<AtomicU64>,
    pub reschedules: Arc<AtomicU64>,
    pub reschedule_compensations: Arc<AtomicU64>,

    pub outcomes_recorded: Arc<AtomicU64>,
    pub ghost_escalations: Arc<AtomicU64>,

    pub reconcile_orphans: Arc<AtomicU64>,
    pub reconcile_missing: Arc<AtomicU64>,

    pub bucket_draws: Arc<AtomicU64>,
    pub bucket_resets: Arc<AtomicU64>,
    pub bucket_conflicts: Arc<AtomicU64>,
}

pub fn bump(c: &AtomicU64) {
    c.fetch_add(1, Ordering::Relaxed);
}

pub fn add(c: &AtomicU64, n: u64) {
    c.fetch_add(n, Ordering::Relaxed);
}

pub fn read(c: &AtomicU64) -> u64 {
    c.load(Ordering::Relaxed)
}
