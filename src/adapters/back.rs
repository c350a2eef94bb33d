//! In-Memory Back Store
//!
//! Authoritative store used by tests and the demo binary. Emits a
//! [`MapEvent`] for every mutation, attributed to the writing client.
//!
//! # Ordering
//!
//! Mutations of one key are serialized by an ordering stripe that stays held
//! while the event is dispatched (sync mode) or queued (async mode), so each
//! listener sees a key's events in mutation order.
//!
//! # Dispatch modes
//!
//! - **Sync** (default): listeners run on the writing thread before the
//!   write returns
//! - **Async**: events go through a channel to a dispatcher thread, like a
//!   remote store delivering notifications after the write completed

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Sender};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::domain::{
    BackStore, CacheKey, CacheValue, ClientId, EntryProcessor, EventKind, ListenerId, MapEvent,
    MapListener, SubscriptionScope,
};
use crate::error::{Error, Result};

const ORDER_STRIPES: usize = 64;

struct Stored<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> Stored<V> {
    fn new(value: V, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

struct Registration<K, V> {
    id: ListenerId,
    scope: SubscriptionScope<K>,
    listener: Arc<dyn MapListener<K, V>>,
}

type Listeners<K, V> = Vec<Arc<dyn MapListener<K, V>>>;

enum Delivery<K, V> {
    Event(Listeners<K, V>, MapEvent<K, V>),
    Flush(Sender<()>),
    Shutdown,
}

struct Dispatcher<K, V> {
    tx: Sender<Delivery<K, V>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<K: CacheKey, V: CacheValue> Dispatcher<K, V> {
    fn spawn() -> Result<Self> {
        let (tx, rx) = channel::unbounded::<Delivery<K, V>>();
        let handle = thread::Builder::new()
            .name("nearcache-dispatch".to_string())
            .spawn(move || {
                for delivery in rx {
                    match delivery {
                        Delivery::Event(listeners, event) => {
                            for listener in &listeners {
                                listener.on_event(&event);
                            }
                        }
                        Delivery::Flush(ack) => {
                            let _ = ack.send(());
                        }
                        Delivery::Shutdown => break,
                    }
                }
            })?;

        Ok(Self {
            tx,
            handle: Mutex::new(Some(handle)),
        })
    }
}

/// In-memory authoritative store with change notifications
pub struct InMemoryBackStore<K, V> {
    data: DashMap<K, Stored<V>>,
    order: Box<[Mutex<()>]>,
    hasher: RandomState,
    listeners: RwLock<Vec<Registration<K, V>>>,
    next_listener: AtomicU64,
    dispatcher: Option<Dispatcher<K, V>>,
    available: AtomicBool,
    latency: Option<Duration>,

    // Instrumentation
    fetches: AtomicU64,
    bulk_fetches: AtomicU64,
    writes: AtomicU64,
    fetches_by_key: DashMap<K, u64>,
}

impl<K: CacheKey, V: CacheValue> Default for InMemoryBackStore<K, V> {
    fn default() -> Self {
        Self::build(None)
    }
}

impl<K: CacheKey, V: CacheValue> InMemoryBackStore<K, V> {
    /// Store delivering events synchronously on the writing thread
    pub fn new() -> Self {
        Self::default()
    }

    /// Store delivering events from a dispatcher thread
    pub fn with_async_dispatch() -> Result<Self> {
        Ok(Self::build(Some(Dispatcher::spawn()?)))
    }

    fn build(dispatcher: Option<Dispatcher<K, V>>) -> Self {
        Self {
            data: DashMap::new(),
            order: (0..ORDER_STRIPES)
                .map(|_| Mutex::new(()))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            hasher: RandomState::new(),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            dispatcher,
            available: AtomicBool::new(true),
            latency: None,
            fetches: AtomicU64::new(0),
            bulk_fetches: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            fetches_by_key: DashMap::new(),
        }
    }

    /// Simulated round-trip time added to every read.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    #[inline]
    fn order_lock(&self, key: &K) -> &Mutex<()> {
        let idx = (self.hasher.hash_one(key) as usize) & (ORDER_STRIPES - 1);
        &self.order[idx]
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::BackStoreUnavailable)
        }
    }

    fn round_trip(&self) {
        if let Some(latency) = self.latency {
            thread::sleep(latency);
        }
    }

    /// Deliver `event` to matching listeners. Caller holds the key's
    /// ordering stripe.
    fn emit(&self, event: MapEvent<K, V>) {
        let listeners: Listeners<K, V> = self
            .listeners
            .read()
            .iter()
            .filter(|r| r.scope.matches(&event.key))
            .map(|r| Arc::clone(&r.listener))
            .collect();

        if listeners.is_empty() {
            return;
        }

        trace!(key = ?event.key, kind = %event.kind, listeners = listeners.len(), "Dispatching event");

        match &self.dispatcher {
            Some(dispatcher) => {
                if dispatcher.tx.send(Delivery::Event(listeners, event)).is_err() {
                    warn!("Event dispatcher stopped; dropping event");
                }
            }
            None => {
                for listener in &listeners {
                    listener.on_event(&event);
                }
            }
        }
    }

    /// Current unexpired value; an expired mapping is removed with a
    /// synthetic delete. Caller holds the key's ordering stripe.
    fn live_value(&self, key: &K) -> Option<V> {
        let expired = match self.data.get(key) {
            Some(stored) if !stored.is_expired() => return Some(stored.value.clone()),
            Some(_) => true,
            None => false,
        };

        if expired && self.data.remove_if(key, |_, s| s.is_expired()).is_some() {
            debug!(key = ?key, "Back entry expired");
            self.emit(MapEvent::synthetic(key.clone(), EventKind::Delete, None));
        }
        None
    }

    fn store(&self, key: K, value: V, ttl: Option<Duration>, origin: ClientId) -> Option<V> {
        let _order = self.order_lock(&key).lock();
        let previous = self.live_value(&key);
        self.data.insert(key.clone(), Stored::new(value.clone(), ttl));
        self.writes.fetch_add(1, Ordering::Relaxed);

        let kind = if previous.is_some() {
            EventKind::Update
        } else {
            EventKind::Insert
        };
        self.emit(MapEvent::client(key, kind, Some(value), origin));
        previous
    }

    // =========================================================================
    // Test and demo controls
    // =========================================================================

    /// Make every operation fail with `BackStoreUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Change a mapping the way a server-side process would: the event is
    /// synthetic and carries no client.
    pub fn apply_synthetic_update(&self, key: K, value: V) {
        let _order = self.order_lock(&key).lock();
        let previous = self.live_value(&key);
        self.data.insert(key.clone(), Stored::new(value.clone(), None));

        let kind = if previous.is_some() {
            EventKind::Update
        } else {
            EventKind::Insert
        };
        self.emit(MapEvent::synthetic(key, kind, Some(value)));
    }

    /// Drop a mapping as if it expired or was evicted server-side.
    pub fn evict(&self, key: &K) -> bool {
        let _order = self.order_lock(key).lock();
        let removed = self.data.remove(key).is_some();
        if removed {
            self.emit(MapEvent::synthetic(key.clone(), EventKind::Delete, None));
        }
        removed
    }

    /// Block until every queued event has been delivered.
    pub fn flush_events(&self) {
        if let Some(dispatcher) = &self.dispatcher {
            let (ack_tx, ack_rx) = channel::bounded(1);
            if dispatcher.tx.send(Delivery::Flush(ack_tx)).is_ok() {
                let _ = ack_rx.recv();
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Single-key reads served
    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Single-key reads served for `key`
    pub fn fetch_count(&self, key: &K) -> u64 {
        self.fetches_by_key.get(key).map(|c| *c).unwrap_or(0)
    }

    /// Bulk reads served
    pub fn bulk_fetches(&self) -> u64 {
        self.bulk_fetches.load(Ordering::Relaxed)
    }

    /// Mappings written by clients
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl<K: CacheKey, V: CacheValue> BackStore<K, V> for InMemoryBackStore<K, V> {
    fn get(&self, key: &K) -> Result<Option<V>> {
        self.check_available()?;
        self.round_trip();
        self.fetches.fetch_add(1, Ordering::Relaxed);
        *self.fetches_by_key.entry(key.clone()).or_insert(0) += 1;

        let _order = self.order_lock(key).lock();
        Ok(self.live_value(key))
    }

    fn get_all(&self, keys: &[K]) -> Result<HashMap<K, V>> {
        self.check_available()?;
        self.round_trip();
        self.bulk_fetches.fetch_add(1, Ordering::Relaxed);

        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            let _order = self.order_lock(key).lock();
            if let Some(value) = self.live_value(key) {
                found.insert(key.clone(), value);
            }
        }
        Ok(found)
    }

    fn put(&self, key: K, value: V, ttl: Option<Duration>, origin: ClientId) -> Result<Option<V>> {
        self.check_available()?;
        Ok(self.store(key, value, ttl, origin))
    }

    fn put_all(&self, entries: HashMap<K, V>, origin: ClientId) -> Result<()> {
        self.check_available()?;
        for (key, value) in entries {
            self.store(key, value, None, origin);
        }
        Ok(())
    }

    fn remove(&self, key: &K, origin: ClientId) -> Result<Option<V>> {
        self.check_available()?;
        let _order = self.order_lock(key).lock();
        let previous = self.live_value(key);
        if previous.is_some() {
            self.data.remove(key);
            self.writes.fetch_add(1, Ordering::Relaxed);
            self.emit(MapEvent::client(key.clone(), EventKind::Delete, None, origin));
        }
        Ok(previous)
    }

    fn invoke(&self, key: &K, processor: EntryProcessor<V>, origin: ClientId) -> Result<Option<V>> {
        self.check_available()?;
        let _order = self.order_lock(key).lock();
        let current = self.live_value(key);
        let existed = current.is_some();
        let updated = processor(current);

        let kind = match (existed, &updated) {
            (false, None) => return Ok(None),
            (true, None) => {
                self.data.remove(key);
                EventKind::Delete
            }
            (existed, Some(value)) => {
                let expires_at = self.data.get(key).and_then(|s| s.expires_at);
                self.data.insert(
                    key.clone(),
                    Stored {
                        value: value.clone(),
                        expires_at,
                    },
                );
                if existed {
                    EventKind::Update
                } else {
                    EventKind::Insert
                }
            }
        };

        self.writes.fetch_add(1, Ordering::Relaxed);
        self.emit(MapEvent::client(key.clone(), kind, updated.clone(), origin));
        Ok(updated)
    }

    fn len(&self) -> Result<usize> {
        self.check_available()?;
        Ok(self.data.iter().filter(|e| !e.value().is_expired()).count())
    }

    fn clear(&self, origin: ClientId) -> Result<()> {
        self.check_available()?;
        let keys: Vec<K> = self.data.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            let _order = self.order_lock(&key).lock();
            if self.data.remove(&key).is_some() {
                self.emit(MapEvent::client(key, EventKind::Delete, None, origin));
            }
        }
        Ok(())
    }

    fn subscribe(
        &self,
        scope: SubscriptionScope<K>,
        listener: Arc<dyn MapListener<K, V>>,
    ) -> Result<ListenerId> {
        self.check_available()?;
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push(Registration {
            id,
            scope,
            listener,
        });
        Ok(id)
    }

    fn unsubscribe(&self, id: ListenerId) -> Result<()> {
        self.listeners.write().retain(|r| r.id != id);
        Ok(())
    }
}

impl<K, V> Drop for InMemoryBackStore<K, V> {
    fn drop(&mut self) {
        let Some(dispatcher) = &self.dispatcher else {
            return;
        };
        let _ = dispatcher.tx.send(Delivery::Shutdown);
        if let Some(handle) = dispatcher.handle.lock().take() {
            // The last reference may be dropped by a listener on the
            // dispatcher thread itself.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
