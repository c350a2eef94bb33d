//! Property-Based Tests for the Near Cache
//!
//! Drives an engine with random operation sequences, including changes made
//! behind its back, and checks it against a plain map model.
//!
//! # Test Properties
//!
//! 1. **Coherence**: with invalidation enabled, reads match the model
//! 2. **Monotonic Statistics**: counters never decrease between resets
//! 3. **Balanced Registrations**: under Logical, subscriptions == front size
//! 4. **Lock Bookkeeping**: reentrant holds match a counting model

#![cfg(test)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use super::{CoherenceEngine, InvalidationStrategy, KeyLockTable};
use crate::adapters::{InMemoryBackStore, LocalFrontStore};
use crate::config::EngineConfig;
use crate::domain::{BackStore, ClientId, FrontStore};

// =============================================================================
// Property Strategies
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Get(u8),
    GetAll(Vec<u8>),
    Put(u8, u16),
    Remove(u8),
    Increment(u8),
    /// Server-side change, no client attached
    Synthetic(u8, u16),
    /// Write by another client
    Foreign(u8, u16),
    /// Server-side removal
    Evict(u8),
    Truncate,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let key = 0u8..16;
    prop_oneof![
        4 => key.clone().prop_map(Op::Get),
        1 => prop::collection::vec(key.clone(), 1..6).prop_map(Op::GetAll),
        2 => (key.clone(), any::<u16>()).prop_map(|(k, v)| Op::Put(k, v)),
        1 => key.clone().prop_map(Op::Remove),
        1 => key.clone().prop_map(Op::Increment),
        2 => (key.clone(), any::<u16>()).prop_map(|(k, v)| Op::Synthetic(k, v)),
        1 => (key.clone(), any::<u16>()).prop_map(|(k, v)| Op::Foreign(k, v)),
        1 => key.prop_map(Op::Evict),
        1 => Just(Op::Truncate),
    ]
}

fn coherent_strategy() -> impl Strategy<Value = InvalidationStrategy> {
    prop_oneof![
        Just(InvalidationStrategy::Present),
        Just(InvalidationStrategy::Logical),
        Just(InvalidationStrategy::All),
    ]
}

struct Harness {
    engine: CoherenceEngine<u8, u16>,
    front: Arc<LocalFrontStore<u8, u16>>,
    back: Arc<InMemoryBackStore<u8, u16>>,
    model: HashMap<u8, u16>,
    other: ClientId,
}

impl Harness {
    fn new(strategy: InvalidationStrategy, capacity: usize, cache_misses: bool) -> Self {
        let front: Arc<LocalFrontStore<u8, u16>> = Arc::new(LocalFrontStore::new(capacity));
        let back: Arc<InMemoryBackStore<u8, u16>> = Arc::new(InMemoryBackStore::new());
        let config = EngineConfig {
            strategy,
            cache_misses,
            batch_size: 3,
            ..Default::default()
        };
        let engine =
            CoherenceEngine::<u8, u16>::new(config, front.clone(), back.clone()).unwrap();
        Self {
            engine,
            front,
            back,
            model: HashMap::new(),
            other: ClientId::new(),
        }
    }

    /// Apply `op`, returning what a read observed (if it was a read).
    fn apply(&mut self, op: &Op) -> Option<Vec<(u8, Option<u16>)>> {
        match op {
            Op::Get(k) => {
                let got = self.engine.get(k).unwrap();
                Some(vec![(*k, got)])
            }
            Op::GetAll(keys) => {
                let found = self.engine.get_all(keys).unwrap();
                Some(keys.iter().map(|k| (*k, found.get(k).copied())).collect())
            }
            Op::Put(k, v) => {
                self.engine.put(*k, *v, None).unwrap();
                self.model.insert(*k, *v);
                None
            }
            Op::Remove(k) => {
                self.engine.remove(k).unwrap();
                self.model.remove(k);
                None
            }
            Op::Increment(k) => {
                let next = self
                    .engine
                    .invoke(k, |v| Some(v.unwrap_or(0).wrapping_add(1)))
                    .unwrap();
                self.model.insert(*k, next.unwrap());
                None
            }
            Op::Synthetic(k, v) => {
                self.back.apply_synthetic_update(*k, *v);
                self.model.insert(*k, *v);
                None
            }
            Op::Foreign(k, v) => {
                self.back.put(*k, *v, None, self.other).unwrap();
                self.model.insert(*k, *v);
                None
            }
            Op::Evict(k) => {
                self.back.evict(k);
                self.model.remove(k);
                None
            }
            Op::Truncate => {
                self.engine.truncate().unwrap();
                None
            }
        }
    }
}

// =============================================================================
// Coherence Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: Every read agrees with the authoritative model.
    #[test]
    fn prop_reads_match_model(
        strategy in coherent_strategy(),
        capacity in 2usize..24,
        cache_misses in any::<bool>(),
        ops in prop::collection::vec(op_strategy(), 1..80),
    ) {
        let mut h = Harness::new(strategy, capacity, cache_misses);

        for op in &ops {
            if let Some(observed) = h.apply(op) {
                for (k, got) in observed {
                    prop_assert_eq!(got, h.model.get(&k).copied(),
                        "strategy={} op={:?} key={}", strategy, op, k);
                }
            }
        }
        prop_assert!(h.engine.lock_table().is_empty());
    }

    /// Property: Statistics never decrease until reset.
    #[test]
    fn prop_statistics_monotonic(
        strategy in coherent_strategy(),
        ops in prop::collection::vec(op_strategy(), 1..60),
        reset_at in 0usize..60,
    ) {
        let mut h = Harness::new(strategy, 8, false);
        let mut previous = h.engine.statistics();

        for (i, op) in ops.iter().enumerate() {
            if i == reset_at {
                h.engine.reset_statistics();
                let zeroed = h.engine.statistics();
                prop_assert_eq!(zeroed.front_hits + zeroed.front_misses, 0);
                prop_assert_eq!(zeroed.invalidation_hits + zeroed.invalidation_misses, 0);
                previous = zeroed;
            }
            h.apply(op);
            let current = h.engine.statistics();
            prop_assert!(current.dominates(&previous), "op={:?}", op);
            previous = current;
        }
    }

    /// Property: Under Logical, each front entry has exactly one subscription.
    #[test]
    fn prop_logical_registrations_balanced(
        capacity in 2usize..12,
        ops in prop::collection::vec(op_strategy(), 1..80),
    ) {
        let mut h = Harness::new(InvalidationStrategy::Logical, capacity, false);

        for op in &ops {
            h.apply(op);
            prop_assert_eq!(
                h.engine.controller().active_subscriptions(),
                h.front.len(),
                "after {:?}", op
            );
            prop_assert_eq!(h.back.listener_count(), h.front.len());
        }
    }
}

// =============================================================================
// Lock Table Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: Holds follow a counting model; unlock without a hold fails.
    #[test]
    fn prop_reentrant_holds(
        ops in prop::collection::vec((any::<bool>(), 0u8..6), 1..100),
    ) {
        let table: KeyLockTable<u8> = KeyLockTable::new(4, Duration::from_millis(5));
        let mut holds: HashMap<u8, u32> = HashMap::new();

        for (acquire, key) in ops {
            if acquire {
                prop_assert!(table.lock(&key, 0)?);
                *holds.entry(key).or_insert(0) += 1;
            } else {
                let held = holds.get(&key).copied().unwrap_or(0);
                prop_assert_eq!(table.unlock(&key), held > 0);
                if held > 1 {
                    holds.insert(key, held - 1);
                } else {
                    holds.remove(&key);
                }
            }

            prop_assert_eq!(table.len(), holds.len());
            for (key, count) in &holds {
                prop_assert!(table.is_held_by_current_thread(key));
                let info = table.locks().into_iter().find(|l| l.key == *key);
                prop_assert_eq!(info.map(|l| l.holds), Some(*count));
            }
        }
    }
}
