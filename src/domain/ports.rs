//! Domain Ports (Port/Adapter Pattern)
//!
//! The near cache depends on two storage collaborators it does not own:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     CoherenceEngine                          │
//! │        (KeyLockTable + InvalidationController)               │
//! └─────────────────────────────────────────────────────────────┘
//!            │                                   │
//!            ▼                                   ▼
//! ┌──────────────────────┐          ┌──────────────────────────┐
//! │  FrontStore (port)   │          │   BackStore (port)       │
//! │  bounded, local      │          │   authoritative, emits   │
//! │  LocalFrontStore     │          │   MapEvents              │
//! └──────────────────────┘          │   InMemoryBackStore      │
//!                                   └──────────────────────────┘
//! ```
//!
//! No coherence logic lives behind these traits; they are pure storage.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::events::{ClientId, ListenerId, MapEvent, SubscriptionScope};
use crate::error::Result;

// =============================================================================
// Key / Value bounds
// =============================================================================

/// Bound satisfied by every type usable as a cache key.
pub trait CacheKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> CacheKey for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

/// Bound satisfied by every type usable as a cache value.
pub trait CacheValue: Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Send + Sync + 'static {}

// =============================================================================
// Entry
// =============================================================================

/// A front-store entry.
///
/// `value == None` records that the back store had no mapping for the key
/// (a negative entry); a missing `Entry` means the back store must be asked.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry<V> {
    pub value: Option<V>,
    pub expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    /// Entry holding a value, optionally expiring after `ttl`.
    pub fn new(value: V, ttl: Option<Duration>) -> Self {
        Self {
            value: Some(value),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    /// Entry recording that the key has no mapping.
    pub fn absent() -> Self {
        Self {
            value: None,
            expires_at: None,
        }
    }

    pub fn is_present(&self) -> bool {
        self.value.is_some()
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

// =============================================================================
// Front Store
// =============================================================================

/// Bounded local key/value store in front of the back store.
///
/// Eviction policy is the implementation's own concern; the only thing the
/// engine needs to know is which keys a `put` pushed out.
pub trait FrontStore<K: CacheKey, V>: Send + Sync {
    /// Look up an entry, counting a hit or a miss. Expired entries are misses.
    fn get(&self, key: &K) -> Option<Entry<V>>;

    /// Look up an entry without touching the hit/miss counters.
    fn peek(&self, key: &K) -> Option<Entry<V>>;

    /// Whether an unexpired entry exists for `key`.
    fn contains(&self, key: &K) -> bool {
        self.peek(key).is_some()
    }

    /// Insert or replace an entry. Returns the keys evicted to make room.
    fn put(&self, key: K, entry: Entry<V>) -> Vec<K>;

    /// Remove an entry.
    fn remove(&self, key: &K) -> Option<Entry<V>>;

    /// Look up several entries; keys without an entry are omitted.
    fn get_all(&self, keys: &[K]) -> HashMap<K, Entry<V>> {
        keys.iter()
            .filter_map(|k| self.get(k).map(|e| (k.clone(), e)))
            .collect()
    }

    /// Insert several entries. Returns the keys evicted to make room.
    fn put_all(&self, entries: Vec<(K, Entry<V>)>) -> Vec<K> {
        entries
            .into_iter()
            .flat_map(|(k, e)| self.put(k, e))
            .collect()
    }

    /// Keys currently held.
    fn keys(&self) -> Vec<K>;

    /// Number of entries currently held.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry.
    fn clear(&self);

    /// Maximum number of entries.
    fn capacity(&self) -> usize;

    fn hits(&self) -> u64;

    fn misses(&self) -> u64;
}

// =============================================================================
// Back Store
// =============================================================================

/// Atomic read-modify-write applied by the back store to one mapping.
///
/// Receives the current value and returns the new one (`None` removes it).
pub type EntryProcessor<V> = Box<dyn FnOnce(Option<V>) -> Option<V> + Send>;

/// Receiver of back-store change notifications.
pub trait MapListener<K, V>: Send + Sync {
    fn on_event(&self, event: &MapEvent<K, V>);
}

/// The authoritative store.
///
/// # Delivery contract
///
/// Notifications for a single key must be delivered in the order of that
/// key's mutations (per-key FIFO). Notifications for different keys may be
/// reordered freely. A store that cannot promise this must not be placed
/// behind a near cache.
///
/// Writes carry the [`ClientId`] of the caller so that the resulting events
/// can be attributed to it.
pub trait BackStore<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Result<Option<V>>;

    /// Fetch several keys in one round trip; absent keys are omitted.
    fn get_all(&self, keys: &[K]) -> Result<HashMap<K, V>>;

    /// Store a mapping, returning the previous value.
    fn put(&self, key: K, value: V, ttl: Option<Duration>, origin: ClientId) -> Result<Option<V>>;

    fn put_all(&self, entries: HashMap<K, V>, origin: ClientId) -> Result<()>;

    /// Remove a mapping, returning the previous value.
    fn remove(&self, key: &K, origin: ClientId) -> Result<Option<V>>;

    /// Apply `processor` atomically to the mapping, returning the new value.
    fn invoke(&self, key: &K, processor: EntryProcessor<V>, origin: ClientId) -> Result<Option<V>>;

    fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn len(&self) -> Result<usize>;

    fn clear(&self, origin: ClientId) -> Result<()>;

    /// Register a listener for the given scope.
    fn subscribe(
        &self,
        scope: SubscriptionScope<K>,
        listener: Arc<dyn MapListener<K, V>>,
    ) -> Result<ListenerId>;

    /// Remove a listener. Unknown ids are ignored.
    fn unsubscribe(&self, id: ListenerId) -> Result<()>;
}
