//! Coherence Engine - Client-Facing Near Cache
//!
//! Reads are served from the front store when possible. A miss takes the
//! key's lock, fetches from the back store and populates the front store
//! unless an invalidation raced the fetch. Writes go to the back store
//! first and are mirrored into the front store under the same lock.
//!
//! # Read path
//!
//! ```text
//! get(k) ──▶ front hit? ──yes──▶ value
//!               │ no
//!               ▼
//!          lock(k) ──▶ front hit? (populated while waiting) ──yes──▶ value
//!               │ no
//!               ▼
//!          register(k) ──▶ back.get(k) ──▶ with_owned(k):
//!                                            not invalidated → front.put
//!                                            invalidated     → discard
//!               ▼
//!          unlock(k) ──▶ flagged? → evict
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::invalidation::{InvalidationController, InvalidationStrategy};
use super::lock::KeyLockTable;
use super::stats::{CacheStatistics, StatisticsSnapshot};
use crate::config::EngineConfig;
use crate::domain::{BackStore, CacheKey, CacheValue, ClientId, Entry, FrontStore, ListenerId};
use crate::error::{Error, Result};

/// Holds one key's lock for the duration of an operation.
struct KeyGuard<'a, K: CacheKey, V: CacheValue> {
    engine: &'a CoherenceEngine<K, V>,
    key: K,
}

impl<K: CacheKey, V: CacheValue> Drop for KeyGuard<'_, K, V> {
    fn drop(&mut self) {
        self.engine.release_key(&self.key);
    }
}

/// Outcome of mirroring a value into the front store.
enum Applied<K> {
    /// Stored; carries the keys the front store evicted for capacity
    Stored(Vec<K>),
    /// Nothing to store (absent value, misses not cached)
    Skipped,
    /// An invalidation raced the operation
    Discarded,
    /// The lock was cleared by a truncate before the value could land
    Revoked,
}

/// Near cache over a front and a back store
pub struct CoherenceEngine<K: CacheKey, V: CacheValue> {
    config: EngineConfig,
    client_id: ClientId,
    front: Arc<dyn FrontStore<K, V>>,
    back: Arc<dyn BackStore<K, V>>,
    locks: Arc<KeyLockTable<K>>,
    controller: Arc<InvalidationController<K, V>>,
    stats: Arc<CacheStatistics>,
    released: AtomicBool,
}

impl<K: CacheKey, V: CacheValue> CoherenceEngine<K, V> {
    /// Build an engine and install the configured invalidation strategy.
    pub fn new(
        config: EngineConfig,
        front: Arc<dyn FrontStore<K, V>>,
        back: Arc<dyn BackStore<K, V>>,
    ) -> Result<Self> {
        config.validate()?;

        let client_id = ClientId::new();
        let locks = Arc::new(KeyLockTable::new(
            config.lock_stripes,
            config.liveness_probe_interval(),
        ));
        let stats = Arc::new(CacheStatistics::new());
        let controller = InvalidationController::new(
            config.strategy,
            client_id,
            Arc::clone(&front),
            Arc::clone(&back),
            Arc::clone(&locks),
            Arc::clone(&stats),
        );
        controller.install()?;

        info!(
            client = %client_id,
            strategy = %config.strategy,
            front_capacity = front.capacity(),
            "Near cache started"
        );

        Ok(Self {
            config,
            client_id,
            front,
            back,
            locks,
            controller,
            stats,
            released: AtomicBool::new(false),
        })
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Look up `key`, populating the front store on a miss.
    #[instrument(level = "debug", skip(self))]
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        self.ensure_live()?;

        if let Some(entry) = self.front.get(key) {
            self.stats.record_front_hit();
            return Ok(entry.value);
        }
        self.stats.record_front_miss();

        self.load(key)
    }

    /// Miss path of `get`: lock, re-check, fetch and populate. Counts no
    /// front hit or miss.
    fn load(&self, key: &K) -> Result<Option<V>> {
        let guard = self.acquire(key)?;
        if let Some(entry) = self.front.peek(key) {
            debug!(key = ?key, "Populated by another thread while waiting");
            return Ok(entry.value);
        }

        let registration = self.controller.register_key(key)?;
        let value = match self.back.get(key) {
            Ok(value) => value,
            Err(e) => {
                self.rollback_registration(key, registration);
                return Err(e);
            }
        };
        self.stats.record_back_fetch();

        let evicted = self.settle(key, value.clone(), None, registration);
        drop(guard);

        self.controller.invalidate_evicted(evicted)?;
        Ok(value)
    }

    /// Look up several keys. Absent keys are omitted from the result.
    ///
    /// Misses are try-locked and fetched in batches of at most `batch_size`
    /// keys. Keys another thread holds are read one by one afterwards, once
    /// every batch lock is released.
    #[instrument(level = "debug", skip(self, keys), fields(keys = keys.len()))]
    pub fn get_all(&self, keys: &[K]) -> Result<HashMap<K, V>> {
        self.ensure_live()?;

        let mut found = HashMap::with_capacity(keys.len());
        let mut misses = Vec::new();
        let mut seen = HashSet::with_capacity(keys.len());

        for key in keys {
            if !seen.insert(key) {
                continue;
            }
            match self.front.get(key) {
                Some(entry) => {
                    self.stats.record_front_hit();
                    if let Some(value) = entry.value {
                        found.insert(key.clone(), value);
                    }
                }
                None => {
                    self.stats.record_front_miss();
                    misses.push(key.clone());
                }
            }
        }

        let mut contended = Vec::new();

        for chunk in misses.chunks(self.config.batch_size) {
            let mut guards = Vec::with_capacity(chunk.len());
            for key in chunk {
                match self.try_acquire(key)? {
                    Some(guard) => guards.push(guard),
                    None => contended.push(key.clone()),
                }
            }

            let mut fetch = Vec::with_capacity(guards.len());
            let mut registrations = HashMap::new();
            for guard in &guards {
                let key = &guard.key;
                if let Some(entry) = self.front.peek(key) {
                    if let Some(value) = entry.value {
                        found.insert(key.clone(), value);
                    }
                    continue;
                }
                match self.controller.register_key(key) {
                    Ok(Some(id)) => {
                        registrations.insert(key.clone(), id);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        self.rollback_registrations(&registrations);
                        return Err(e);
                    }
                }
                fetch.push(key.clone());
            }

            if fetch.is_empty() {
                continue;
            }

            let mut fetched = match self.back.get_all(&fetch) {
                Ok(fetched) => fetched,
                Err(e) => {
                    self.rollback_registrations(&registrations);
                    return Err(e);
                }
            };
            self.stats.record_back_bulk_fetch();
            debug!(requested = fetch.len(), returned = fetched.len(), "Batch fetched");

            let mut evicted = Vec::new();
            for key in fetch {
                let value = fetched.remove(&key);
                let registration = registrations.get(&key).copied();
                evicted.extend(self.settle(&key, value.clone(), None, registration));
                if let Some(value) = value {
                    found.insert(key, value);
                }
            }
            drop(guards);

            self.controller.invalidate_evicted(evicted)?;
        }

        // Already counted as front misses above.
        for key in contended {
            if let Some(value) = self.load(&key)? {
                found.insert(key, value);
            }
        }
        Ok(found)
    }

    /// Whether `key` has a mapping. Answered from the front store when it
    /// holds an entry.
    pub fn contains_key(&self, key: &K) -> Result<bool> {
        self.ensure_live()?;
        match self.front.peek(key) {
            Some(entry) => Ok(entry.is_present()),
            None => self.back.contains_key(key),
        }
    }

    /// Number of mappings in the back store
    pub fn len(&self) -> Result<usize> {
        self.ensure_live()?;
        self.back.len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Number of entries in the front store
    pub fn front_len(&self) -> usize {
        self.front.len()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Write through to the back store and mirror the value locally.
    #[instrument(level = "debug", skip(self, value))]
    pub fn put(&self, key: K, value: V, ttl: Option<Duration>) -> Result<Option<V>> {
        self.ensure_live()?;

        let guard = self.acquire(&key)?;
        let registration = self.controller.register_key(&key)?;
        let previous = match self.back.put(key.clone(), value.clone(), ttl, self.client_id) {
            Ok(previous) => previous,
            Err(e) => {
                if !self.front.contains(&key) {
                    self.rollback_registration(&key, registration);
                }
                return Err(e);
            }
        };
        self.stats.record_direct_write();

        let evicted = self.settle(&key, Some(value), ttl, registration);
        drop(guard);

        self.controller.invalidate_evicted(evicted)?;
        Ok(previous)
    }

    /// Write several mappings with one back-store call.
    ///
    /// Keys whose lock is free are mirrored locally; keys another thread
    /// holds are invalidated instead.
    #[instrument(level = "debug", skip(self, entries), fields(entries = entries.len()))]
    pub fn put_all(&self, entries: HashMap<K, V>) -> Result<()> {
        self.ensure_live()?;

        let mut guards = Vec::with_capacity(entries.len());
        let mut contended = Vec::new();
        for key in entries.keys() {
            match self.try_acquire(key)? {
                Some(guard) => guards.push(guard),
                None => contended.push(key.clone()),
            }
        }

        let mut registrations = HashMap::new();
        for guard in &guards {
            match self.controller.register_key(&guard.key) {
                Ok(Some(id)) => {
                    registrations.insert(guard.key.clone(), id);
                }
                Ok(None) => {}
                Err(e) => {
                    self.rollback_registrations(&registrations);
                    return Err(e);
                }
            }
        }

        let local: Vec<(K, V)> = guards
            .iter()
            .filter_map(|g| entries.get(&g.key).map(|v| (g.key.clone(), v.clone())))
            .collect();

        if let Err(e) = self.back.put_all(entries, self.client_id) {
            registrations.retain(|key, _| !self.front.contains(key));
            self.rollback_registrations(&registrations);
            return Err(e);
        }
        self.stats.record_direct_write();

        let mut evicted = Vec::new();
        for (key, value) in local {
            let registration = registrations.get(&key).copied();
            evicted.extend(self.settle(&key, Some(value), None, registration));
        }
        drop(guards);

        self.controller.invalidate_evicted(evicted)?;
        for key in contended {
            self.controller.invalidate_local(&key)?;
        }
        Ok(())
    }

    /// Remove `key` from both tiers.
    #[instrument(level = "debug", skip(self))]
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        self.ensure_live()?;

        let guard = self.acquire(key)?;
        let previous = self.back.remove(key, self.client_id)?;
        self.stats.record_direct_write();
        self.controller.evict_locked(key);
        drop(guard);

        Ok(previous)
    }

    /// Apply `processor` atomically in the back store and mirror the result.
    #[instrument(level = "debug", skip(self, processor))]
    pub fn invoke<F>(&self, key: &K, processor: F) -> Result<Option<V>>
    where
        F: FnOnce(Option<V>) -> Option<V> + Send + 'static,
    {
        self.ensure_live()?;

        let guard = self.acquire(key)?;
        let registration = self.controller.register_key(key)?;
        let updated = match self.back.invoke(key, Box::new(processor), self.client_id) {
            Ok(updated) => updated,
            Err(e) => {
                if !self.front.contains(key) {
                    self.rollback_registration(key, registration);
                }
                return Err(e);
            }
        };
        self.stats.record_direct_write();

        let evicted = match &updated {
            Some(_) => self.settle(key, updated.clone(), None, registration),
            None => {
                self.controller.evict_locked(key);
                Vec::new()
            }
        };
        drop(guard);

        self.controller.invalidate_evicted(evicted)?;
        Ok(updated)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Drop every local entry, lock and subscription, then resubscribe.
    ///
    /// Populates in flight lose their lock and discard what they fetched.
    #[instrument(level = "debug", skip(self))]
    pub fn truncate(&self) -> Result<()> {
        self.ensure_live()?;

        self.front.clear();
        self.controller.uninstall_all();

        // Nothing can lock a key until the sweep below returns, so no
        // populate can land between it and the lock table being emptied.
        self.locks.clear_all_with(|| {
            self.controller.uninstall_all();
            self.front.clear();
            self.controller.install()
        })?;

        info!(client = %self.client_id, "Truncated near cache");
        Ok(())
    }

    /// Clear the back store, then truncate the near tier.
    #[instrument(level = "debug", skip(self))]
    pub fn clear(&self) -> Result<()> {
        self.ensure_live()?;
        self.back.clear(self.client_id)?;
        self.truncate()
    }

    /// Detach from the back store for good. Every later call fails with
    /// `Error::Released`.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.controller.uninstall_all();
        self.locks.clear_all();
        self.front.clear();
        info!(client = %self.client_id, "Near cache released");
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    // =========================================================================
    // Statistics & accessors
    // =========================================================================

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.stats.snapshot(self.locks.abandoned_reclaimed())
    }

    pub fn reset_statistics(&self) {
        self.stats.reset();
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn strategy(&self) -> InvalidationStrategy {
        self.config.strategy
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn lock_table(&self) -> &KeyLockTable<K> {
        &self.locks
    }

    pub fn controller(&self) -> &InvalidationController<K, V> {
        &self.controller
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn ensure_live(&self) -> Result<()> {
        if self.is_released() {
            Err(Error::Released)
        } else {
            Ok(())
        }
    }

    fn acquire(&self, key: &K) -> Result<KeyGuard<'_, K, V>> {
        if self.locks.lock(key, self.config.lock_timeout_ms)? {
            return Ok(KeyGuard {
                engine: self,
                key: key.clone(),
            });
        }
        self.stats.record_lock_timeout();
        Err(Error::lock_timeout(
            key,
            self.config.lock_timeout_ms.max(0) as u64,
        ))
    }

    fn try_acquire(&self, key: &K) -> Result<Option<KeyGuard<'_, K, V>>> {
        Ok(self.locks.lock(key, 0)?.then(|| KeyGuard {
            engine: self,
            key: key.clone(),
        }))
    }

    fn release_key(&self, key: &K) {
        match self.locks.unlock_reporting(key) {
            Some(true) => {
                if let Err(e) = self.controller.invalidate_local(key) {
                    warn!(key = ?key, "Failed to apply deferred invalidation: {}", e);
                }
            }
            Some(false) => {}
            None => debug!(key = ?key, "Lock was cleared before release"),
        }
    }

    /// Mirror a fetched or written value into the front store, rolling back
    /// the key's registration when nothing was stored.
    fn settle(
        &self,
        key: &K,
        value: Option<V>,
        ttl: Option<Duration>,
        registration: Option<ListenerId>,
    ) -> Vec<K> {
        match self.apply_front(key, value, ttl) {
            Applied::Stored(evicted) => evicted,
            outcome => {
                match outcome {
                    Applied::Discarded => {
                        self.stats.record_populate_discard();
                        debug!(key = ?key, "Discarded value raced by an invalidation");
                    }
                    Applied::Revoked => {
                        self.stats.record_populate_discard();
                        debug!(key = ?key, "Discarded value after truncate");
                    }
                    _ => {}
                }
                self.rollback_registration(key, registration);
                Vec::new()
            }
        }
    }

    fn apply_front(&self, key: &K, value: Option<V>, ttl: Option<Duration>) -> Applied<K> {
        let entry = match value {
            Some(value) => Some(Entry::new(value, ttl)),
            None if self.config.cache_misses => Some(Entry::absent()),
            None => None,
        };

        let applied = self.locks.with_owned(key, |invalidated| {
            if invalidated {
                self.front.remove(key);
                return Applied::Discarded;
            }
            match entry {
                Some(entry) => Applied::Stored(self.front.put(key.clone(), entry)),
                None => {
                    self.front.remove(key);
                    Applied::Skipped
                }
            }
        });

        applied.unwrap_or(Applied::Revoked)
    }

    fn rollback_registration(&self, key: &K, registration: Option<ListenerId>) {
        if let Some(id) = registration {
            self.controller.unregister_registration(key, id);
        }
    }

    fn rollback_registrations(&self, registrations: &HashMap<K, ListenerId>) {
        for (key, id) in registrations {
            self.controller.unregister_registration(key, *id);
        }
    }
}

impl<K: CacheKey, V: CacheValue> Drop for CoherenceEngine<K, V> {
    fn drop(&mut self) {
        if !self.released.load(Ordering::Acquire) {
            self.controller.uninstall_all();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
