//! Local Front Store - bounded in-process tier
//!
//! Sharded hashmap with entry-count capacity and watermark eviction.
//!
//! # Design
//!
//! - Each shard has its own `RwLock`, so unrelated keys rarely contend
//! - Least-recently-accessed entries are evicted first, expired ones before all
//! - Eviction runs once the store exceeds capacity and stops at the low watermark

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::domain::{CacheKey, CacheValue, Entry, FrontStore};

/// Default number of shards
pub const DEFAULT_FRONT_SHARDS: usize = 16;

/// Front store configuration
#[derive(Debug, Clone)]
pub struct LocalFrontConfig {
    /// Maximum number of entries
    pub capacity: usize,
    /// Fraction of capacity kept after an eviction pass
    pub low_watermark: f64,
    /// Number of shards (rounded up to a power of two)
    pub shards: usize,
}

impl Default for LocalFrontConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            low_watermark: 0.90,
            shards: DEFAULT_FRONT_SHARDS,
        }
    }
}

struct Slot<V> {
    entry: Entry<V>,
    last_access: AtomicU64,
}

/// Bounded local front store
pub struct LocalFrontStore<K, V> {
    shards: Box<[RwLock<HashMap<K, Slot<V>>>]>,
    hasher: RandomState,
    config: LocalFrontConfig,
    len: AtomicUsize,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<K: CacheKey, V: CacheValue> LocalFrontStore<K, V> {
    /// Create a store holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self::with_config(LocalFrontConfig {
            capacity,
            ..Default::default()
        })
    }

    pub fn with_config(config: LocalFrontConfig) -> Self {
        let count = config.shards.max(1).next_power_of_two();
        let shards = (0..count)
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            shards,
            hasher: RandomState::new(),
            config: LocalFrontConfig {
                capacity: config.capacity.max(1),
                low_watermark: config.low_watermark.clamp(0.0, 1.0),
                shards: count,
            },
            len: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    #[inline]
    fn shard(&self, key: &K) -> &RwLock<HashMap<K, Slot<V>>> {
        let idx = (self.hasher.hash_one(key) as usize) & (self.shards.len() - 1);
        &self.shards[idx]
    }

    #[inline]
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn remove_expired(&self, key: &K) {
        let mut shard = self.shard(key).write();
        if shard.get(key).is_some_and(|slot| slot.entry.is_expired())
            && shard.remove(key).is_some()
        {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Evict until the low watermark is reached, sparing `keep`.
    fn evict(&self, keep: &K) -> Vec<K> {
        let target = ((self.config.capacity as f64) * self.config.low_watermark) as usize;

        let mut candidates: Vec<(K, bool, u64)> = Vec::new();
        for shard in self.shards.iter() {
            let guard = shard.read();
            for (key, slot) in guard.iter() {
                if key != keep {
                    candidates.push((
                        key.clone(),
                        slot.entry.is_expired(),
                        slot.last_access.load(Ordering::Relaxed),
                    ));
                }
            }
        }

        // Expired first, then least recently accessed
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

        let mut evicted = Vec::new();
        for (key, _, _) in candidates {
            if self.len.load(Ordering::Relaxed) <= target {
                break;
            }
            if self.shard(&key).write().remove(&key).is_some() {
                self.len.fetch_sub(1, Ordering::Relaxed);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                evicted.push(key);
            }
        }
        evicted
    }

    /// Number of capacity evictions so far
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Hit ratio (0.0 - 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }
}

impl<K: CacheKey, V: CacheValue> FrontStore<K, V> for LocalFrontStore<K, V> {
    fn get(&self, key: &K) -> Option<Entry<V>> {
        let found = {
            let shard = self.shard(key).read();
            match shard.get(key) {
                Some(slot) if !slot.entry.is_expired() => {
                    slot.last_access.store(self.tick(), Ordering::Relaxed);
                    Some(Ok(slot.entry.clone()))
                }
                Some(_) => Some(Err(())),
                None => None,
            }
        };

        match found {
            Some(Ok(entry)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            Some(Err(())) => {
                self.remove_expired(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn peek(&self, key: &K) -> Option<Entry<V>> {
        let shard = self.shard(key).read();
        shard
            .get(key)
            .filter(|slot| !slot.entry.is_expired())
            .map(|slot| slot.entry.clone())
    }

    fn put(&self, key: K, entry: Entry<V>) -> Vec<K> {
        let slot = Slot {
            entry,
            last_access: AtomicU64::new(self.tick()),
        };

        let inserted = self.shard(&key).write().insert(key.clone(), slot).is_none();
        if inserted {
            let len = self.len.fetch_add(1, Ordering::Relaxed) + 1;
            if len > self.config.capacity {
                return self.evict(&key);
            }
        }
        Vec::new()
    }

    fn remove(&self, key: &K) -> Option<Entry<V>> {
        let removed = self.shard(key).write().remove(key)?;
        self.len.fetch_sub(1, Ordering::Relaxed);
        Some(removed.entry)
    }

    fn keys(&self) -> Vec<K> {
        self.shards
            .iter()
            .flat_map(|s| s.read().keys().cloned().collect::<Vec<_>>())
            .collect()
    }

    fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    fn clear(&self) {
        for shard in self.shards.iter() {
            let mut guard = shard.write();
            let removed = guard.len();
            guard.clear();
            self.len.fetch_sub(removed, Ordering::Relaxed);
        }
    }

    fn capacity(&self) -> usize {
        self.config.capacity
    }

    fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Tests
// =============================================================================
