//! nearcache - Two-Tier Near Cache Coherence
//!
//! A near cache keeps a bounded local copy (the front store) of an
//! authoritative, possibly remote store (the back store) and uses the back
//! store's change notifications to keep the copy coherent.
//!
//! # Architecture
//!
//! ```text
//! caller ──▶ CoherenceEngine ──▶ FrontStore (local, bounded)
//!                 │   ▲
//!                 │   └── InvalidationController ◀── MapEvents
//!                 ▼                                     │
//!            KeyLockTable                       BackStore (authoritative)
//! ```
//!
//! # Guarantees
//!
//! - Concurrent misses for one key cause one back fetch
//! - A value fetched before an invalidation never replaces the invalidation
//! - Locks held by exited threads are reclaimed lazily
//! - Truncating the near tier leaves no entry and no lock behind
//!
//! # Modules
//!
//! - [`adapters`] - Reference front/back stores and Prometheus export
//! - [`config`] - Engine configuration
//! - [`domain`] - Store ports and change events
//! - [`error`] - Error types
//! - [`near`] - Lock table, invalidation and the coherence engine

pub mod adapters;
pub mod config;
pub mod domain;
pub mod error;
pub mod near;

// Re-export commonly used types
pub use config::EngineConfig;
pub use domain::{BackStore, ClientId, Entry, FrontStore, MapEvent, MapListener};
pub use error::{Error, Result};
pub use near::{CacheStatistics, CoherenceEngine, InvalidationStrategy, KeyLockTable, StatisticsSnapshot};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_default_engine_from_reexports() {
        let front = Arc::new(adapters::LocalFrontStore::<u64, String>::new(16));
        let back = Arc::new(adapters::InMemoryBackStore::<u64, String>::new());
        let engine = CoherenceEngine::<u64, String>::new(EngineConfig::default(), front, back).unwrap();

        assert_eq!(engine.strategy(), InvalidationStrategy::Present);
        assert_eq!(engine.get(&1).unwrap(), None);
    }
}
