//! Near Cache - Two-Tier Coherence
//!
//! Keeps a bounded local front store consistent with an authoritative back
//! store that publishes change notifications.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         CoherenceEngine                              │
//! │   get / get_all / put / put_all / remove / invoke / truncate         │
//! ├──────────────────────────────┬───────────────────────────────────────┤
//! │  KeyLockTable                │  InvalidationController               │
//! │  ┌────────────────────────┐  │  ┌─────────────────────────────────┐  │
//! │  │ striped control map    │◀─┼──│ lock_or_mark on every event     │  │
//! │  │ owner liveness tokens  │  │  │ None / Present / Logical / All  │  │
//! │  └────────────────────────┘  │  └─────────────────────────────────┘  │
//! ├──────────────────────────────┴───────────────────────────────────────┤
//! │          FrontStore (local, bounded)  │  BackStore (authoritative)   │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - At most one back fetch in flight per key and engine
//! - A populate that raced an invalidation never lands in the front store
//! - `truncate` leaves the front store and the control map empty
//! - Locks held by threads that exited are reclaimed on the next attempt

mod engine;
mod invalidation;
mod lock;
mod proptest;
mod stats;

pub use engine::CoherenceEngine;
pub use invalidation::{InvalidationController, InvalidationStrategy};
pub use lock::{KeyLockInfo, KeyLockTable, LockOutcome};
pub use stats::{CacheStatistics, StatisticsSnapshot};

/// Default number of control-map stripes
pub const DEFAULT_LOCK_STRIPES: usize = 64;
