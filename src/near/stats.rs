//! Near Cache Statistics
//!
//! Monotonic counters created with the engine. They only go down through an
//! explicit `reset()`.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Near cache statistics collector
#[derive(Debug, Default)]
pub struct CacheStatistics {
    // Front tier
    front_hits: AtomicU64,
    front_misses: AtomicU64,

    // Invalidation
    invalidation_hits: AtomicU64,
    invalidation_misses: AtomicU64,
    listener_registrations: AtomicU64,

    // Back tier round trips
    back_fetches: AtomicU64,
    back_bulk_fetches: AtomicU64,
    direct_writes: AtomicU64,

    // Coordination
    populate_discards: AtomicU64,
    lock_timeouts: AtomicU64,
}

impl CacheStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_front_hit(&self) {
        self.front_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_front_miss(&self) {
        self.front_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// An invalidation matched an entry present in the front store.
    pub fn record_invalidation_hit(&self) {
        self.invalidation_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// An invalidation arrived for a key not in the front store.
    pub fn record_invalidation_miss(&self) {
        self.invalidation_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_listener_registration(&self) {
        self.listener_registrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_back_fetch(&self) {
        self.back_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_back_bulk_fetch(&self) {
        self.back_bulk_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_direct_write(&self) {
        self.direct_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// A populate or write was not applied to the front store.
    pub fn record_populate_discard(&self) {
        self.populate_discards.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_timeout(&self) {
        self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn front_hits(&self) -> u64 {
        self.front_hits.load(Ordering::Relaxed)
    }

    pub fn front_misses(&self) -> u64 {
        self.front_misses.load(Ordering::Relaxed)
    }

    pub fn invalidation_hits(&self) -> u64 {
        self.invalidation_hits.load(Ordering::Relaxed)
    }

    pub fn invalidation_misses(&self) -> u64 {
        self.invalidation_misses.load(Ordering::Relaxed)
    }

    pub fn listener_registrations(&self) -> u64 {
        self.listener_registrations.load(Ordering::Relaxed)
    }

    /// Snapshot every counter. `abandoned_locks` comes from the lock table.
    pub fn snapshot(&self, abandoned_locks: u64) -> StatisticsSnapshot {
        StatisticsSnapshot {
            front_hits: self.front_hits(),
            front_misses: self.front_misses(),
            invalidation_hits: self.invalidation_hits(),
            invalidation_misses: self.invalidation_misses(),
            listener_registrations: self.listener_registrations(),
            back_fetches: self.back_fetches.load(Ordering::Relaxed),
            back_bulk_fetches: self.back_bulk_fetches.load(Ordering::Relaxed),
            direct_writes: self.direct_writes.load(Ordering::Relaxed),
            populate_discards: self.populate_discards.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            abandoned_locks,
            taken_at: Utc::now(),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        self.front_hits.store(0, Ordering::Relaxed);
        self.front_misses.store(0, Ordering::Relaxed);
        self.invalidation_hits.store(0, Ordering::Relaxed);
        self.invalidation_misses.store(0, Ordering::Relaxed);
        self.listener_registrations.store(0, Ordering::Relaxed);
        self.back_fetches.store(0, Ordering::Relaxed);
        self.back_bulk_fetches.store(0, Ordering::Relaxed);
        self.direct_writes.store(0, Ordering::Relaxed);
        self.populate_discards.store(0, Ordering::Relaxed);
        self.lock_timeouts.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub front_hits: u64,
    pub front_misses: u64,
    pub invalidation_hits: u64,
    pub invalidation_misses: u64,
    pub listener_registrations: u64,
    pub back_fetches: u64,
    pub back_bulk_fetches: u64,
    pub direct_writes: u64,
    pub populate_discards: u64,
    pub lock_timeouts: u64,
    pub abandoned_locks: u64,
    pub taken_at: DateTime<Utc>,
}

impl StatisticsSnapshot {
    /// Front hit ratio (0.0 - 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let total = self.front_hits + self.front_misses;
        if total == 0 {
            0.0
        } else {
            self.front_hits as f64 / total as f64
        }
    }

    /// Whether no counter is lower than in `earlier`.
    pub fn dominates(&self, earlier: &StatisticsSnapshot) -> bool {
        self.front_hits >= earlier.front_hits
            && self.front_misses >= earlier.front_misses
            && self.invalidation_hits >= earlier.invalidation_hits
            && self.invalidation_misses >= earlier.invalidation_misses
            && self.listener_registrations >= earlier.listener_registrations
            && self.back_fetches >= earlier.back_fetches
            && self.back_bulk_fetches >= earlier.back_bulk_fetches
            && self.direct_writes >= earlier.direct_writes
            && self.populate_discards >= earlier.populate_discards
            && self.lock_timeouts >= earlier.lock_timeouts
            && self.abandoned_locks >= earlier.abandoned_locks
    }
}
