//! Invalidation Controller
//!
//! Subscribes to back-store change notifications according to the
//! configured strategy and applies them to the front store.
//!
//! # Applying a notification
//!
//! ```text
//!  event ──▶ strategy filter ──▶ hit/miss stats ──▶ own write, delivered later? ──▶ keep
//!                                                     │ no
//!                                                     ▼
//!                                               lock_or_mark(key)
//!                                                     │
//!                        ┌────────────────────────────┴───────────┐
//!                        ▼                                        ▼
//!               another thread owns key                 lock acquired
//!               (populate or write in flight)           ├─ own write on this thread → overwrite
//!               → flag lock, owner discards             └─ anything else → evict (+ unregister)
//!                 its result and evicts
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry as Slot;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::lock::{KeyLockTable, LockOutcome};
use super::stats::CacheStatistics;
use crate::domain::{
    BackStore, CacheKey, CacheValue, ClientId, Entry, FrontStore, ListenerId, MapEvent,
    MapListener, SubscriptionScope,
};
use crate::error::{Error, Result};

/// Which back-store notifications the near cache listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidationStrategy {
    /// No subscription; entries are only replaced or removed by the caller
    None,
    /// One map-wide subscription; events for cached or in-flight keys apply
    #[default]
    Present,
    /// One subscription per cached key, registered when the key is faulted in
    Logical,
    /// One map-wide subscription; every event is evaluated
    All,
}

impl InvalidationStrategy {
    /// Whether the strategy needs a map-wide listener.
    pub fn uses_global_subscription(&self) -> bool {
        matches!(self, InvalidationStrategy::Present | InvalidationStrategy::All)
    }
}

impl fmt::Display for InvalidationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidationStrategy::None => write!(f, "none"),
            InvalidationStrategy::Present => write!(f, "present"),
            InvalidationStrategy::Logical => write!(f, "logical"),
            InvalidationStrategy::All => write!(f, "all"),
        }
    }
}

impl FromStr for InvalidationStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(InvalidationStrategy::None),
            "present" => Ok(InvalidationStrategy::Present),
            "logical" => Ok(InvalidationStrategy::Logical),
            "all" => Ok(InvalidationStrategy::All),
            other => Err(Error::Config(format!(
                "unknown invalidation strategy '{}'",
                other
            ))),
        }
    }
}

/// Listener handed to the back store. Holds the controller weakly so a
/// dropped engine is not kept alive by its subscriptions.
struct FrontInvalidator<K: CacheKey, V> {
    controller: Weak<InvalidationController<K, V>>,
}

impl<K: CacheKey, V: CacheValue> MapListener<K, V> for FrontInvalidator<K, V> {
    fn on_event(&self, event: &MapEvent<K, V>) {
        let Some(controller) = self.controller.upgrade() else {
            return;
        };
        if let Err(e) = controller.on_notification(event) {
            error!(key = ?event.key, kind = %event.kind, "Failed to apply invalidation: {}", e);
        }
    }
}

/// Keeps the front store consistent with back-store notifications.
pub struct InvalidationController<K: CacheKey, V> {
    strategy: InvalidationStrategy,
    client_id: ClientId,
    front: Arc<dyn FrontStore<K, V>>,
    back: Arc<dyn BackStore<K, V>>,
    locks: Arc<KeyLockTable<K>>,
    stats: Arc<CacheStatistics>,
    listener: Arc<dyn MapListener<K, V>>,
    /// Map-wide subscription (Present / All)
    global: Mutex<Option<ListenerId>>,
    /// Per-key subscriptions (Logical)
    registrations: DashMap<K, ListenerId>,
}

impl<K: CacheKey, V: CacheValue> InvalidationController<K, V> {
    pub fn new(
        strategy: InvalidationStrategy,
        client_id: ClientId,
        front: Arc<dyn FrontStore<K, V>>,
        back: Arc<dyn BackStore<K, V>>,
        locks: Arc<KeyLockTable<K>>,
        stats: Arc<CacheStatistics>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            strategy,
            client_id,
            front,
            back,
            locks,
            stats,
            listener: Arc::new(FrontInvalidator {
                controller: weak.clone(),
            }),
            global: Mutex::new(None),
            registrations: DashMap::new(),
        })
    }

    pub fn strategy(&self) -> InvalidationStrategy {
        self.strategy
    }

    // =========================================================================
    // Subscription management
    // =========================================================================

    /// Wire the subscription the strategy needs. Idempotent.
    pub fn install(&self) -> Result<()> {
        if !self.strategy.uses_global_subscription() {
            return Ok(());
        }

        let mut global = self.global.lock();
        if global.is_some() {
            return Ok(());
        }

        let id = self
            .back
            .subscribe(SubscriptionScope::All, Arc::clone(&self.listener))?;
        self.stats.record_listener_registration();
        *global = Some(id);

        info!(strategy = %self.strategy, listener = %id, "Installed map-wide invalidation listener");
        Ok(())
    }

    /// Register a per-key subscription (Logical only).
    ///
    /// Returns the key's registration, new or existing; `None` for
    /// strategies without per-key subscriptions.
    pub fn register_key(&self, key: &K) -> Result<Option<ListenerId>> {
        if self.strategy != InvalidationStrategy::Logical {
            return Ok(None);
        }

        match self.registrations.entry(key.clone()) {
            Slot::Occupied(existing) => Ok(Some(*existing.get())),
            Slot::Vacant(slot) => {
                let id = self.back.subscribe(
                    SubscriptionScope::Key(key.clone()),
                    Arc::clone(&self.listener),
                )?;
                slot.insert(id);
                self.stats.record_listener_registration();
                debug!(key = ?key, listener = %id, "Registered key listener");
                Ok(Some(id))
            }
        }
    }

    /// Drop the per-key subscription for `key`, whatever it is.
    pub fn unregister_key(&self, key: &K) {
        if let Some((_, id)) = self.registrations.remove(key) {
            self.unsubscribe_quietly(id);
        }
    }

    /// Drop the per-key subscription for `key` only if it is still `id`.
    ///
    /// Used by populates that lost their lock: a newer registration made by
    /// whoever owns the key now must survive.
    pub fn unregister_registration(&self, key: &K, id: ListenerId) {
        if let Some((_, id)) = self.registrations.remove_if(key, |_, current| *current == id) {
            self.unsubscribe_quietly(id);
        }
    }

    /// Drop every subscription. Never fails; safe to call repeatedly.
    pub fn uninstall_all(&self) {
        let global = self.global.lock().take();
        if let Some(id) = global {
            self.unsubscribe_quietly(id);
            info!(listener = %id, "Removed map-wide invalidation listener");
        }

        let keys: Vec<K> = self
            .registrations
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let mut removed = 0usize;
        for key in keys {
            if let Some((_, id)) = self.registrations.remove(&key) {
                self.unsubscribe_quietly(id);
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "Removed key listeners");
        }
    }

    fn unsubscribe_quietly(&self, id: ListenerId) {
        if let Err(e) = self.back.unsubscribe(id) {
            warn!(listener = %id, "Failed to unsubscribe listener: {}", e);
        }
    }

    /// Subscriptions currently held (map-wide plus per-key).
    pub fn active_subscriptions(&self) -> usize {
        let global = usize::from(self.global.lock().is_some());
        global + self.registrations.len()
    }

    /// Per-key subscriptions currently held.
    pub fn registered_keys(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_registered(&self, key: &K) -> bool {
        self.registrations.contains_key(key)
    }

    // =========================================================================
    // Notification handling
    // =========================================================================

    /// Apply one back-store notification to the front store.
    pub fn on_notification(&self, event: &MapEvent<K, V>) -> Result<()> {
        let key = &event.key;
        if self.strategy == InvalidationStrategy::None {
            return Ok(());
        }

        // Lock first: a populate released before this read has already
        // reached the front store, so `contains` below observes it.
        let locked = self.locks.is_locked(key);
        let was_present = self.front.contains(key);

        if self.strategy == InvalidationStrategy::Present && !was_present && !locked {
            self.stats.record_invalidation_miss();
            return Ok(());
        }

        if was_present {
            self.stats.record_invalidation_hit();
        } else {
            self.stats.record_invalidation_miss();
        }

        let reentrant = self.locks.is_held_by_current_thread(key);
        if !reentrant && event.is_attributable_to(self.client_id) {
            // This client only writes a key while holding its lock, and the
            // direct write already reached the front store.
            debug!(key = ?key, "Keeping front entry written by this client");
            return Ok(());
        }

        if self.locks.lock_or_mark(key)? == LockOutcome::MarkedInvalid {
            debug!(key = ?key, kind = %event.kind, "Deferred invalidation to in-flight owner");
            return Ok(());
        }

        let evicted = self.apply_locked(event, reentrant);
        let flagged = self.locks.unlock_reporting(key).unwrap_or(false);

        if flagged {
            self.invalidate_local(key)?;
        }
        self.invalidate_evicted(evicted)
    }

    /// Apply an event while holding the key's lock. Returns keys the front
    /// store evicted for capacity.
    fn apply_locked(&self, event: &MapEvent<K, V>, reentrant: bool) -> Vec<K> {
        let key = &event.key;

        // Delivered on the writing thread, an own event carries the freshest
        // value there is.
        if reentrant && event.is_attributable_to(self.client_id) {
            if let (Some(value), Some(current)) = (&event.new_value, self.front.peek(key)) {
                debug!(key = ?key, "Refreshing front entry from own write");
                return self.front.put(
                    key.clone(),
                    Entry {
                        value: Some(value.clone()),
                        expires_at: current.expires_at,
                    },
                );
            }
            return Vec::new();
        }

        debug!(
            key = ?key,
            kind = %event.kind,
            synthetic = event.synthetic,
            "Evicting front entry"
        );
        self.evict_locked(key);
        Vec::new()
    }

    /// Remove `key` from the front store; caller holds the key's lock.
    pub(crate) fn evict_locked(&self, key: &K) {
        self.front.remove(key);
        if self.strategy == InvalidationStrategy::Logical {
            self.unregister_key(key);
        }
    }

    /// Evict `key` unless another thread owns it, in which case the owner is
    /// flagged and evicts when it releases.
    pub fn invalidate_local(&self, key: &K) -> Result<()> {
        match self.locks.lock_or_mark(key)? {
            LockOutcome::MarkedInvalid => Ok(()),
            LockOutcome::Acquired => {
                self.evict_locked(key);
                self.locks.unlock_reporting(key);
                Ok(())
            }
        }
    }

    /// Invalidate keys the front store pushed out for capacity.
    pub(crate) fn invalidate_evicted(&self, keys: Vec<K>) -> Result<()> {
        for key in keys {
            self.invalidate_local(&key)?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryBackStore, LocalFrontStore};
    use crate::domain::EventKind;
    use std::time::Duration;

    struct Fixture {
        front: Arc<LocalFrontStore<String, String>>,
        back: Arc<InMemoryBackStore<String, String>>,
        locks: Arc<KeyLockTable<String>>,
        stats: Arc<CacheStatistics>,
        client: ClientId,
        controller: Arc<InvalidationController<String, String>>,
    }

    fn fixture(strategy: InvalidationStrategy) -> Fixture {
        let front: Arc<LocalFrontStore<String, String>> = Arc::new(LocalFrontStore::new(100));
        let back: Arc<InMemoryBackStore<String, String>> = Arc::new(InMemoryBackStore::new());
        let locks = Arc::new(KeyLockTable::new(4, Duration::from_millis(10)));
        let stats = Arc::new(CacheStatistics::new());
        let client = ClientId::new();
        let controller = InvalidationController::<String, String>::new(
            strategy,
            client,
            front.clone(),
            back.clone(),
            locks.clone(),
            stats.clone(),
        );
        controller.install().unwrap();
        Fixture {
            front,
            back,
            locks,
            stats,
            client,
            controller,
        }
    }

    fn k(s: &str) -> String {
        s.to_string()
    }

    #[test]
    fn test_strategy_parse_and_display() {
        for s in ["none", "present", "logical", "all"] {
            let parsed: InvalidationStrategy = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
        assert!("PRESENT".parse::<InvalidationStrategy>().is_ok());
        assert!("bogus".parse::<InvalidationStrategy>().is_err());
    }

    #[test]
    fn test_install_is_idempotent() {
        let f = fixture(InvalidationStrategy::Present);
        f.controller.install().unwrap();
        assert_eq!(f.controller.active_subscriptions(), 1);
        assert_eq!(f.back.listener_count(), 1);
        assert_eq!(f.stats.listener_registrations(), 1);
    }

    #[test]
    fn test_none_strategy_subscribes_nothing() {
        let f = fixture(InvalidationStrategy::None);
        assert_eq!(f.back.listener_count(), 0);
        assert_eq!(f.controller.register_key(&k("a")).unwrap(), None);
    }

    #[test]
    fn test_synthetic_update_evicts_present_entry() {
        let f = fixture(InvalidationStrategy::Present);
        f.front.put(k("a"), Entry::new(k("old"), None));

        f.controller
            .on_notification(&MapEvent::synthetic(k("a"), EventKind::Update, Some(k("new"))))
            .unwrap();

        assert!(!f.front.contains(&k("a")));
        assert_eq!(f.stats.invalidation_hits(), 1);
        assert!(f.locks.is_empty());
    }

    #[test]
    fn test_present_ignores_absent_keys() {
        let f = fixture(InvalidationStrategy::Present);
        f.controller
            .on_notification(&MapEvent::synthetic(k("zz"), EventKind::Delete, None))
            .unwrap();
        assert_eq!(f.stats.invalidation_misses(), 1);
        assert!(f.locks.is_empty());
    }

    #[test]
    fn test_foreign_client_write_evicts() {
        let f = fixture(InvalidationStrategy::All);
        f.front.put(k("a"), Entry::new(k("mine"), None));

        let other = ClientId::new();
        f.controller
            .on_notification(&MapEvent::client(k("a"), EventKind::Update, Some(k("theirs")), other))
            .unwrap();

        assert!(!f.front.contains(&k("a")));
    }

    #[test]
    fn test_own_write_delivered_later_keeps_entry() {
        let f = fixture(InvalidationStrategy::All);
        f.front.put(k("a"), Entry::new(k("v2"), None));

        f.controller
            .on_notification(&MapEvent::client(k("a"), EventKind::Update, Some(k("v1")), f.client))
            .unwrap();

        assert_eq!(f.front.peek(&k("a")).unwrap().value, Some(k("v2")));
    }

    #[test]
    fn test_own_write_on_writing_thread_overwrites() {
        let f = fixture(InvalidationStrategy::All);
        f.front.put(k("a"), Entry::new(k("v1"), None));

        assert!(f.locks.lock(&k("a"), 0).unwrap());
        f.controller
            .on_notification(&MapEvent::client(k("a"), EventKind::Update, Some(k("v2")), f.client))
            .unwrap();
        assert!(f.locks.is_held_by_current_thread(&k("a")));
        assert!(f.locks.unlock(&k("a")));

        assert_eq!(f.front.peek(&k("a")).unwrap().value, Some(k("v2")));
    }

    #[test]
    fn test_own_delete_evicts() {
        let f = fixture(InvalidationStrategy::All);
        f.front.put(k("a"), Entry::new(k("v1"), None));

        f.controller
            .on_notification(&MapEvent::client(k("a"), EventKind::Delete, None, f.client))
            .unwrap();

        assert!(!f.front.contains(&k("a")));
    }

    #[test]
    fn test_event_during_foreign_populate_marks_lock() {
        let f = fixture(InvalidationStrategy::Present);
        let locks = f.locks.clone();
        let (held_tx, held_rx) = crossbeam::channel::bounded(0);
        let (done_tx, done_rx) = crossbeam::channel::bounded::<()>(0);

        let owner = std::thread::spawn(move || {
            locks.lock(&k("a"), 0).unwrap();
            held_tx.send(()).unwrap();
            done_rx.recv().unwrap();
            let flagged = locks.with_owned(&k("a"), |invalidated| invalidated);
            locks.unlock(&k("a"));
            flagged
        });

        held_rx.recv().unwrap();
        f.controller
            .on_notification(&MapEvent::synthetic(k("a"), EventKind::Update, Some(k("x"))))
            .unwrap();
        done_tx.send(()).unwrap();

        assert_eq!(owner.join().unwrap(), Some(true));
        assert!(f.locks.is_empty());
    }

    #[test]
    fn test_logical_registration_is_balanced() {
        let f = fixture(InvalidationStrategy::Logical);
        let first = f.controller.register_key(&k("a")).unwrap().unwrap();
        let again = f.controller.register_key(&k("a")).unwrap().unwrap();
        assert_eq!(first, again);
        assert_eq!(f.back.listener_count(), 1);
        assert_eq!(f.stats.listener_registrations(), 1);

        f.front.put(k("a"), Entry::new(k("v"), None));
        f.controller
            .on_notification(&MapEvent::synthetic(k("a"), EventKind::Delete, None))
            .unwrap();

        assert!(!f.controller.is_registered(&k("a")));
        assert_eq!(f.back.listener_count(), 0);
    }

    #[test]
    fn test_unregister_registration_spares_newer_registration() {
        let f = fixture(InvalidationStrategy::Logical);
        let old = f.controller.register_key(&k("a")).unwrap().unwrap();
        f.controller.unregister_key(&k("a"));
        let newer = f.controller.register_key(&k("a")).unwrap().unwrap();
        assert_ne!(old, newer);

        f.controller.unregister_registration(&k("a"), old);
        assert!(f.controller.is_registered(&k("a")));

        f.controller.unregister_registration(&k("a"), newer);
        assert!(!f.controller.is_registered(&k("a")));
    }

    #[test]
    fn test_uninstall_all_twice() {
        let f = fixture(InvalidationStrategy::Logical);
        f.controller.register_key(&k("a")).unwrap();
        f.controller.register_key(&k("b")).unwrap();

        f.controller.uninstall_all();
        f.controller.uninstall_all();

        assert_eq!(f.controller.active_subscriptions(), 0);
        assert_eq!(f.back.listener_count(), 0);
    }

    #[test]
    fn test_listener_delivery_through_back_store() {
        let f = fixture(InvalidationStrategy::Present);
        f.front.put(k("a"), Entry::new(k("v1"), None));

        f.back.apply_synthetic_update(k("a"), k("v2"));

        assert!(!f.front.contains(&k("a")));
        assert_eq!(f.stats.invalidation_hits(), 1);
    }
}
