//! Near Cache Integration Tests
//!
//! Multi-threaded scenarios driven through the public API:
//! - Populates racing invalidations and truncates
//! - Lock ownership and reclamation across threads
//! - Subscription bookkeeping under churn
//! - Asynchronous event delivery

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};

use nearcache::adapters::{InMemoryBackStore, LocalFrontStore};
use nearcache::domain::{Entry, EntryProcessor, ListenerId, MapListener, SubscriptionScope};
use nearcache::{
    BackStore, ClientId, CoherenceEngine, EngineConfig, Error, FrontStore, InvalidationStrategy,
    Result,
};

type Engine = CoherenceEngine<String, String>;

fn k(s: &str) -> String {
    s.to_string()
}

fn engine_over(
    strategy: InvalidationStrategy,
    capacity: usize,
    back: Arc<dyn BackStore<String, String>>,
) -> (Engine, Arc<LocalFrontStore<String, String>>) {
    let front: Arc<LocalFrontStore<String, String>> = Arc::new(LocalFrontStore::new(capacity));
    let config = EngineConfig {
        strategy,
        ..Default::default()
    };
    let engine = Engine::new(config, front.clone(), back).unwrap();
    (engine, front)
}

/// One-shot rendezvous: the next call through an armed gate parks until
/// the test releases it.
struct Gate {
    armed: AtomicBool,
    entered: (Sender<()>, Receiver<()>),
    proceed: (Sender<()>, Receiver<()>),
}

impl Gate {
    fn new() -> Self {
        Self {
            armed: AtomicBool::new(false),
            entered: unbounded(),
            proceed: unbounded(),
        }
    }

    fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    fn wait_entered(&self) {
        self.entered.1.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    fn release(&self) {
        self.proceed.0.send(()).unwrap();
    }

    fn pass(&self) {
        if self.armed.swap(false, Ordering::SeqCst) {
            let _ = self.entered.0.send(());
            let _ = self.proceed.1.recv();
        }
    }
}

/// Back store whose gated `get` parks after reading.
///
/// Lets a test interleave work between a fetch and the populate that
/// follows it.
struct GatedBackStore {
    inner: Arc<InMemoryBackStore<String, String>>,
    gate: Gate,
}

impl GatedBackStore {
    fn new(inner: Arc<InMemoryBackStore<String, String>>) -> Self {
        Self {
            inner,
            gate: Gate::new(),
        }
    }
}

impl BackStore<String, String> for GatedBackStore {
    fn get(&self, key: &String) -> Result<Option<String>> {
        let value = self.inner.get(key)?;
        self.gate.pass();
        Ok(value)
    }

    fn get_all(&self, keys: &[String]) -> Result<HashMap<String, String>> {
        self.inner.get_all(keys)
    }

    fn put(
        &self,
        key: String,
        value: String,
        ttl: Option<Duration>,
        origin: ClientId,
    ) -> Result<Option<String>> {
        self.inner.put(key, value, ttl, origin)
    }

    fn put_all(&self, entries: HashMap<String, String>, origin: ClientId) -> Result<()> {
        self.inner.put_all(entries, origin)
    }

    fn remove(&self, key: &String, origin: ClientId) -> Result<Option<String>> {
        self.inner.remove(key, origin)
    }

    fn invoke(
        &self,
        key: &String,
        processor: EntryProcessor<String>,
        origin: ClientId,
    ) -> Result<Option<String>> {
        self.inner.invoke(key, processor, origin)
    }

    fn len(&self) -> Result<usize> {
        self.inner.len()
    }

    fn clear(&self, origin: ClientId) -> Result<()> {
        self.inner.clear(origin)
    }

    fn subscribe(
        &self,
        scope: SubscriptionScope<String>,
        listener: Arc<dyn MapListener<String, String>>,
    ) -> Result<ListenerId> {
        self.inner.subscribe(scope, listener)
    }

    fn unsubscribe(&self, id: ListenerId) -> Result<()> {
        self.inner.unsubscribe(id)
    }
}

/// Front store whose gated `contains` parks after answering.
struct GatedFrontStore {
    inner: LocalFrontStore<String, String>,
    gate: Gate,
}

impl GatedFrontStore {
    fn new(capacity: usize) -> Self {
        Self {
            inner: LocalFrontStore::new(capacity),
            gate: Gate::new(),
        }
    }
}

impl FrontStore<String, String> for GatedFrontStore {
    fn get(&self, key: &String) -> Option<Entry<String>> {
        self.inner.get(key)
    }

    fn peek(&self, key: &String) -> Option<Entry<String>> {
        self.inner.peek(key)
    }

    fn contains(&self, key: &String) -> bool {
        let present = self.inner.contains(key);
        self.gate.pass();
        present
    }

    fn put(&self, key: String, entry: Entry<String>) -> Vec<String> {
        self.inner.put(key, entry)
    }

    fn remove(&self, key: &String) -> Option<Entry<String>> {
        self.inner.remove(key)
    }

    fn keys(&self) -> Vec<String> {
        self.inner.keys()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn clear(&self) {
        self.inner.clear()
    }

    fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    fn hits(&self) -> u64 {
        self.inner.hits()
    }

    fn misses(&self) -> u64 {
        self.inner.misses()
    }
}

// =============================================================================
// Populate Races
// =============================================================================

mod populate_race_tests {
    use super::*;

    #[test]
    fn test_invalidation_during_fetch_discards_value() {
        let inner = Arc::new(InMemoryBackStore::<String, String>::new());
        inner.apply_synthetic_update(k("k"), k("v1"));
        let gated = Arc::new(GatedBackStore::new(inner.clone()));
        let (engine, front) = engine_over(InvalidationStrategy::Present, 16, gated.clone());

        gated.gate.arm();
        thread::scope(|s| {
            let reader = s.spawn(|| engine.get(&k("k")));

            gated.gate.wait_entered();
            // The reader already holds v1 and the key lock.
            inner.apply_synthetic_update(k("k"), k("v2"));
            gated.gate.release();

            assert_eq!(reader.join().unwrap().unwrap(), Some(k("v1")));
        });

        assert!(!front.contains(&k("k")));
        assert!(engine.lock_table().is_empty());
        assert_eq!(engine.statistics().populate_discards, 1);

        assert_eq!(engine.get(&k("k")).unwrap(), Some(k("v2")));
        assert_eq!(front.len(), 1);
    }

    #[test]
    fn test_present_event_racing_populate_release_still_evicts() {
        let inner = Arc::new(InMemoryBackStore::<String, String>::new());
        inner.apply_synthetic_update(k("k"), k("a"));
        let gated_back = Arc::new(GatedBackStore::new(inner.clone()));
        let gated_front = Arc::new(GatedFrontStore::new(16));
        let engine = Engine::new(
            EngineConfig::default(),
            gated_front.clone(),
            gated_back.clone(),
        )
        .unwrap();

        gated_back.gate.arm();
        thread::scope(|s| {
            let reader = s.spawn(|| engine.get(&k("k")));
            gated_back.gate.wait_entered();

            // The event looks at the front store while the populate still
            // holds "a" and the key lock.
            gated_front.gate.arm();
            let writer = s.spawn(|| inner.apply_synthetic_update(k("k"), k("b")));
            gated_front.gate.wait_entered();

            // The populate lands and unlocks before the event resumes.
            gated_back.gate.release();
            assert_eq!(reader.join().unwrap().unwrap(), Some(k("a")));

            gated_front.gate.release();
            writer.join().unwrap();
        });

        assert_eq!(inner.get(&k("k")).unwrap(), Some(k("b")));
        assert_eq!(gated_front.len(), 0);
        assert_eq!(engine.get(&k("k")).unwrap(), Some(k("b")));
        assert!(engine.lock_table().is_empty());
    }

    #[test]
    fn test_truncate_during_fetch_leaves_nothing_behind() {
        let inner = Arc::new(InMemoryBackStore::<String, String>::new());
        inner.apply_synthetic_update(k("k"), k("v1"));
        let gated = Arc::new(GatedBackStore::new(inner.clone()));
        let (engine, front) = engine_over(InvalidationStrategy::Present, 16, gated.clone());

        gated.gate.arm();
        thread::scope(|s| {
            let reader = s.spawn(|| engine.get(&k("k")));

            gated.gate.wait_entered();
            engine.truncate().unwrap();
            gated.gate.release();

            assert_eq!(reader.join().unwrap().unwrap(), Some(k("v1")));
        });

        assert_eq!(front.len(), 0);
        assert!(engine.lock_table().is_empty());
        assert_eq!(engine.statistics().populate_discards, 1);
        assert_eq!(inner.listener_count(), 1);

        // The reinstalled listener still invalidates.
        assert_eq!(engine.get(&k("k")).unwrap(), Some(k("v1")));
        inner.apply_synthetic_update(k("k"), k("v2"));
        assert_eq!(front.len(), 0);
        assert_eq!(engine.get(&k("k")).unwrap(), Some(k("v2")));
    }

    #[test]
    fn test_logical_truncate_during_fetch_drops_registration() {
        let inner = Arc::new(InMemoryBackStore::<String, String>::new());
        inner.apply_synthetic_update(k("k"), k("v1"));
        let gated = Arc::new(GatedBackStore::new(inner.clone()));
        let (engine, front) = engine_over(InvalidationStrategy::Logical, 16, gated.clone());

        gated.gate.arm();
        thread::scope(|s| {
            let reader = s.spawn(|| engine.get(&k("k")));

            gated.gate.wait_entered();
            assert_eq!(inner.listener_count(), 1);
            engine.truncate().unwrap();
            gated.gate.release();

            reader.join().unwrap().unwrap();
        });

        assert_eq!(front.len(), 0);
        assert_eq!(engine.controller().registered_keys(), 0);
        assert_eq!(inner.listener_count(), 0);
    }

    #[test]
    fn test_waiter_interrupted_by_truncate() {
        let back = Arc::new(InMemoryBackStore::<String, String>::new());
        let (engine, _front) = engine_over(InvalidationStrategy::Present, 16, back);
        let (held_tx, held_rx) = unbounded();
        let (done_tx, done_rx) = unbounded::<()>();

        thread::scope(|s| {
            let holder = s.spawn(|| {
                assert!(engine.lock_table().lock(&k("k"), -1).unwrap());
                held_tx.send(()).unwrap();
                done_rx.recv().unwrap();
                // Truncate revoked the hold.
                engine.lock_table().unlock(&k("k"))
            });
            held_rx.recv().unwrap();

            let waiter = s.spawn(|| engine.get(&k("k")));
            while !engine
                .lock_table()
                .locks()
                .iter()
                .any(|l| l.key == "k" && l.waiters > 0)
            {
                thread::sleep(Duration::from_millis(1));
            }

            engine.truncate().unwrap();

            let err = waiter.join().unwrap().unwrap_err();
            assert!(matches!(err, Error::LockInterrupted { .. }));
            assert!(err.is_retryable());

            done_tx.send(()).unwrap();
            assert!(!holder.join().unwrap());
        });

        assert!(engine.lock_table().is_empty());
    }
}

// =============================================================================
// Lock Ownership
// =============================================================================

mod ownership_tests {
    use super::*;

    #[test]
    fn test_concurrent_misses_fetch_each_key_once() {
        let back = Arc::new(
            InMemoryBackStore::<String, String>::new().with_latency(Duration::from_millis(10)),
        );
        for i in 0..4 {
            back.apply_synthetic_update(format!("k{i}"), format!("v{i}"));
        }
        let (engine, _front) = engine_over(InvalidationStrategy::Present, 64, back.clone());
        let barrier = Barrier::new(8);

        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    barrier.wait();
                    for i in 0..4 {
                        let value = engine.get(&format!("k{i}")).unwrap();
                        assert_eq!(value, Some(format!("v{i}")));
                    }
                });
            }
        });

        for i in 0..4 {
            assert_eq!(back.fetch_count(&format!("k{i}")), 1);
        }
        assert_eq!(engine.statistics().back_fetches, 4);
    }

    #[test]
    fn test_unlock_by_non_owner_is_refused() {
        let back = Arc::new(InMemoryBackStore::<String, String>::new());
        let (engine, _front) = engine_over(InvalidationStrategy::Present, 16, back);
        let (held_tx, held_rx) = unbounded();
        let (done_tx, done_rx) = unbounded::<()>();

        thread::scope(|s| {
            let owner = s.spawn(|| {
                engine.lock_table().lock(&k("k"), -1).unwrap();
                held_tx.send(()).unwrap();
                done_rx.recv().unwrap();
                engine.lock_table().unlock(&k("k"))
            });
            held_rx.recv().unwrap();

            assert!(!engine.lock_table().unlock(&k("k")));
            assert!(engine.lock_table().is_locked(&k("k")));
            assert!(!engine.lock_table().lock(&k("k"), 0).unwrap());

            done_tx.send(()).unwrap();
            assert!(owner.join().unwrap());
        });

        assert!(!engine.lock_table().is_locked(&k("k")));
    }

    #[test]
    fn test_lock_of_exited_thread_is_reclaimed() {
        let back = Arc::new(InMemoryBackStore::<String, String>::new());
        back.apply_synthetic_update(k("k"), k("v"));
        let (engine, _front) = engine_over(InvalidationStrategy::Present, 16, back);

        thread::scope(|s| {
            s.spawn(|| {
                assert!(engine.lock_table().lock(&k("k"), -1).unwrap());
            });
        });
        assert!(engine.lock_table().is_locked(&k("k")));

        assert_eq!(engine.get(&k("k")).unwrap(), Some(k("v")));
        assert!(engine.lock_table().is_empty());
        assert_eq!(engine.statistics().abandoned_locks, 1);
    }

    #[test]
    fn test_bounded_wait_times_out() {
        let back = Arc::new(InMemoryBackStore::<String, String>::new());
        let front: Arc<LocalFrontStore<String, String>> = Arc::new(LocalFrontStore::new(16));
        let config = EngineConfig {
            lock_timeout_ms: 20,
            ..Default::default()
        };
        let engine = Engine::new(config, front, back).unwrap();
        let (held_tx, held_rx) = unbounded();
        let (done_tx, done_rx) = unbounded::<()>();

        thread::scope(|s| {
            s.spawn(|| {
                engine.lock_table().lock(&k("k"), -1).unwrap();
                held_tx.send(()).unwrap();
                done_rx.recv().unwrap();
                engine.lock_table().unlock(&k("k"));
            });
            held_rx.recv().unwrap();

            let err = engine.put(k("k"), k("v"), None).unwrap_err();
            assert!(matches!(err, Error::LockTimeout { .. }));
            done_tx.send(()).unwrap();
        });

        assert_eq!(engine.statistics().lock_timeouts, 1);
    }
}

// =============================================================================
// Subscription Bookkeeping
// =============================================================================

mod subscription_tests {
    use super::*;

    #[test]
    fn test_logical_subscriptions_track_front_under_churn() {
        let back = Arc::new(InMemoryBackStore::<String, String>::new());
        for i in 0..20 {
            back.apply_synthetic_update(format!("k{i}"), format!("v{i}"));
        }
        let (engine, front) = engine_over(InvalidationStrategy::Logical, 4, back.clone());

        for round in 0..3 {
            for i in 0..20 {
                let key = format!("k{i}");
                engine.get(&key).unwrap();
                match (i + round) % 5 {
                    0 => back.apply_synthetic_update(key, format!("r{round}")),
                    1 => {
                        engine.remove(&key).unwrap();
                    }
                    2 => {
                        back.evict(&key);
                    }
                    _ => {}
                }
                assert_eq!(engine.controller().registered_keys(), front.len());
                assert_eq!(back.listener_count(), front.len());
            }
        }

        engine.truncate().unwrap();
        assert_eq!(back.listener_count(), 0);
    }

    #[test]
    fn test_two_clients_invalidate_each_other() {
        let back = Arc::new(InMemoryBackStore::<String, String>::new());
        let (a, front_a) = engine_over(InvalidationStrategy::Present, 16, back.clone());
        let (b, front_b) = engine_over(InvalidationStrategy::All, 16, back.clone());

        a.put(k("k"), k("from-a"), None).unwrap();
        assert_eq!(b.get(&k("k")).unwrap(), Some(k("from-a")));
        assert_eq!(front_b.len(), 1);

        b.put(k("k"), k("from-b"), None).unwrap();
        assert_eq!(front_a.len(), 0);
        assert_eq!(a.get(&k("k")).unwrap(), Some(k("from-b")));

        a.remove(&k("k")).unwrap();
        assert_eq!(front_b.len(), 0);
        assert_eq!(b.get(&k("k")).unwrap(), None);
    }

    #[test]
    fn test_release_detaches_from_back_store() {
        let back = Arc::new(InMemoryBackStore::<String, String>::new());
        let (engine, front) = engine_over(InvalidationStrategy::Present, 16, back.clone());
        engine.put(k("k"), k("v"), None).unwrap();

        engine.release();
        engine.release();

        assert_eq!(back.listener_count(), 0);
        assert_eq!(front.len(), 0);
        assert!(matches!(engine.get(&k("k")), Err(Error::Released)));
        assert_eq!(back.get(&k("k")).unwrap(), Some(k("v")));
    }
}

// =============================================================================
// Asynchronous Delivery
// =============================================================================

mod async_dispatch_tests {
    use super::*;

    #[test]
    fn test_own_write_survives_late_echo() {
        let back = Arc::new(InMemoryBackStore::<String, String>::with_async_dispatch().unwrap());
        let (engine, front) = engine_over(InvalidationStrategy::Present, 16, back.clone());

        engine.put(k("k"), k("v1"), None).unwrap();
        back.flush_events();

        assert_eq!(front.len(), 1);
        assert_eq!(engine.get(&k("k")).unwrap(), Some(k("v1")));
        assert_eq!(back.fetches(), 0);
    }

    #[test]
    fn test_foreign_write_evicts_after_flush() {
        let back = Arc::new(InMemoryBackStore::<String, String>::with_async_dispatch().unwrap());
        let (engine, front) = engine_over(InvalidationStrategy::Present, 16, back.clone());
        let other = ClientId::new();

        engine.put(k("k"), k("v1"), None).unwrap();
        back.put(k("k"), k("v2"), None, other).unwrap();
        back.flush_events();

        assert_eq!(front.len(), 0);
        assert_eq!(engine.get(&k("k")).unwrap(), Some(k("v2")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_workers_converge() {
        let back = Arc::new(InMemoryBackStore::<String, String>::with_async_dispatch().unwrap());
        let (engine, _front) = engine_over(InvalidationStrategy::Present, 32, back.clone());
        let engine = Arc::new(engine);

        let mut handles = Vec::new();
        for worker in 0..4 {
            let engine = Arc::clone(&engine);
            let back = Arc::clone(&back);
            handles.push(tokio::task::spawn_blocking(move || {
                for i in 0..200 {
                    let key = format!("k{}", i % 10);
                    match (i + worker) % 4 {
                        0 => {
                            engine.put(key, format!("w{worker}-{i}"), None).unwrap();
                        }
                        1 => back.apply_synthetic_update(key, format!("s{worker}-{i}")),
                        _ => {
                            engine.get(&key).unwrap();
                        }
                    }
                }
            }));
        }
        for handle in futures::future::join_all(handles).await {
            handle.unwrap();
        }

        back.flush_events();
        for i in 0..10 {
            let key = format!("k{i}");
            assert_eq!(engine.get(&key).unwrap(), back.get(&key).unwrap());
        }
        assert!(engine.lock_table().is_empty());
    }
}
