//! Infrastructure Adapters
//!
//! Concrete implementations of the domain ports, plus metrics export.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │        FrontStore  │  BackStore  │  MapListener             │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ LocalFrontStore │ InMemoryBackStore │ StatisticsExporter   │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use nearcache::adapters::{InMemoryBackStore, LocalFrontStore};
//! use nearcache::{CoherenceEngine, EngineConfig};
//!
//! let front = Arc::new(LocalFrontStore::new(10_000));
//! let back = Arc::new(InMemoryBackStore::new());
//! let engine = CoherenceEngine::<String, String>::new(EngineConfig::default(), front, back)?;
//! ```

mod back;
mod front;
mod prometheus;

pub use back::InMemoryBackStore;
pub use front::{LocalFrontConfig, LocalFrontStore, DEFAULT_FRONT_SHARDS};
pub use prometheus::StatisticsExporter;
