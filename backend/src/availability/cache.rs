use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, instrument};

use crate::availability::generator::AvailableSlot;
use crate::availability::template::DateRange;

/// Last generated availability for one staff member.
#[derive(Clone, Debug, PartialEq)]
pub struct CachedAvailability {
    pub staff_id: String,
    pub range: DateRange,
    /// Ascending by start.
    pub slots: Vec<AvailableSlot>,
    pub generated_at: DateTime<Utc>,
    /// Set when a refresh failed and this entry is older than it should be.
    pub stale: bool,
    /// Dates touched by bookings since generation, each with the sequence
    /// number of its latest invalidation. Regenerated on next read.
    pub invalidated: BTreeMap<NaiveDate, u64>,
}

/// Availability snapshots keyed by staff id.
///
/// Only the refresh cycle writes slots. Bookings never write derived slots;
/// they mark dates invalidated and the next read regenerates those dates.
/// A generation stored after it was overtaken by an invalidation keeps that
/// invalidation.
#[derive(Default)]
pub struct AvailabilityCache {
    inner: Mutex<Inner>,
    seq: AtomicU64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, CachedAvailability>,
    /// Invalidations for members without an entry yet.
    early: HashMap<String, BTreeMap<NaiveDate, u64>>,
}

impl AvailabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn get(&self, staff_id: &str) -> Option<CachedAvailability> {
        self.inner.lock().entries.get(staff_id).cloned()
    }

    /// Taken before a generation reads the calendar. Invalidations numbered
    /// above it happened while the generation was in flight.
    pub fn generation_mark(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Replaces the whole entry with a generation that started at `mark`.
    /// Dates invalidated after `mark` stay invalidated.
    #[instrument(skip(self, slots), target = "cache", fields(slots = slots.len()))]
    pub fn store(
        &self,
        staff_id: &str,
        range: DateRange,
        slots: Vec<AvailableSlot>,
        generated_at: DateTime<Utc>,
        mark: u64,
    ) {
        let mut inner = self.inner.lock();
        let mut carried: BTreeMap<NaiveDate, u64> = inner
            .entries
            .get(staff_id)
            .map(|e| e.invalidated.clone())
            .unwrap_or_default();
        if let Some(early) = inner.early.remove(staff_id) {
            carried.extend(early);
        }
        carried.retain(|date, version| *version > mark && range.contains(*date));

        if !carried.is_empty() {
            debug!(dates = carried.len(), "invalidations newer than this generation kept");
        }
        inner.entries.insert(
            staff_id.to_string(),
            CachedAvailability {
                staff_id: staff_id.to_string(),
                range,
                slots,
                generated_at,
                stale: false,
                invalidated: carried,
            },
        );
        debug!("availability snapshot stored");
    }

    /// Swaps in regenerated slots for the dates in `seen` (as read from the
    /// entry before regenerating). A date invalidated again in the meantime
    /// keeps its flag.
    pub fn replace_dates(
        &self,
        staff_id: &str,
        seen: &BTreeMap<NaiveDate, u64>,
        fresh: Vec<AvailableSlot>,
    ) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(staff_id) else {
            return false;
        };

        entry.slots.retain(|s| !seen.contains_key(&s.slot.date));
        entry
            .slots
            .extend(fresh.into_iter().filter(|s| seen.contains_key(&s.slot.date)));
        entry.slots.sort_by_key(|s| s.starts_at);

        for (date, version) in seen {
            if entry.invalidated.get(date) == Some(version) {
                entry.invalidated.remove(date);
            }
        }
        true
    }

    pub fn mark_stale(&self, staff_id: &str) -> bool {
        match self.inner.lock().entries.get_mut(staff_id) {
            Some(entry) => {
                entry.stale = true;
                true
            }
            None => false,
        }
    }

    /// Marks `date` for regeneration in `staff_id`'s entry. Dates outside the
    /// cached range are ignored. Without an entry the mark waits for the
    /// first stored generation.
    pub fn invalidate(&self, staff_id: &str, date: NaiveDate) {
        let mut inner = self.inner.lock();
        let version = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        match inner.entries.get_mut(staff_id) {
            Some(entry) if entry.range.contains(date) => {
                entry.invalidated.insert(date, version);
                debug!(staff_id, %date, "availability date invalidated");
            }
            Some(_) => {}
            None => {
                inner.early.entry(staff_id.to_string()).or_default().insert(date, version);
            }
        }
    }

    pub fn clear(&self) {
        let count = {
            let mut inner = self.inner.lock();
            let n = inner.entries.len();
            inner.entries.clear();
            inner.early.clear();
            n
        };
        info!(count, "availability cache cleared");
    }
}
