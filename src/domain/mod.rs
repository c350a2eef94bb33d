//! Domain Layer
//!
//! Contracts between the near cache and the stores it sits between.
//!
//! - **Ports** (`ports.rs`) - `FrontStore`, `BackStore` and `MapListener` traits
//! - **Events** (`events.rs`) - change notifications and client identity
//!
//! # Usage
//!
//! ```ignore
//! use nearcache::domain::{BackStore, ClientId, MapEvent, SubscriptionScope};
//!
//! let id = back.subscribe(SubscriptionScope::All, listener)?;
//! back.put("k".to_string(), 1, None, ClientId::new())?;
//! back.unsubscribe(id)?;
//! ```

pub mod events;
pub mod ports;

// Re-export commonly used types
pub use events::{ClientId, EventKind, ListenerId, MapEvent, SubscriptionScope};
pub use ports::{
    BackStore, CacheKey, CacheValue, Entry, EntryProcessor, FrontStore, MapListener,
};
