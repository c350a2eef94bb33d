//! Change Notifications
//!
//! Events emitted by a back store when a mapping is inserted, updated or
//! deleted. Each event says whether it was caused by a client-facing write
//! (and which client made it) or produced by the store itself (expiry,
//! upstream eviction, read-through load).

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a client issuing writes against a back store.
///
/// Every near cache instance owns one; the back store stamps it onto the
/// events its writes produce so the cache can recognise its own changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Generate a fresh random client identity.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle of a listener registered with a back store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Which keys a subscription covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionScope<K> {
    /// Every key in the map
    All,
    /// A single key
    Key(K),
}

impl<K: PartialEq> SubscriptionScope<K> {
    /// Whether an event for `key` falls within this scope.
    pub fn matches(&self, key: &K) -> bool {
        match self {
            SubscriptionScope::All => true,
            SubscriptionScope::Key(k) => k == key,
        }
    }
}

/// Kind of change a notification describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Insert => write!(f, "insert"),
            EventKind::Update => write!(f, "update"),
            EventKind::Delete => write!(f, "delete"),
        }
    }
}

/// A change notification delivered by a back store.
#[derive(Debug, Clone, PartialEq)]
pub struct MapEvent<K, V> {
    /// Key whose mapping changed
    pub key: K,
    /// What happened to it
    pub kind: EventKind,
    /// True when the change was not made by a client-facing write
    pub synthetic: bool,
    /// Value after the change (`None` for deletes)
    pub new_value: Option<V>,
    /// Client whose write caused the change, if any
    pub origin: Option<ClientId>,
}

impl<K, V> MapEvent<K, V> {
    /// Event produced by a client write.
    pub fn client(key: K, kind: EventKind, new_value: Option<V>, origin: ClientId) -> Self {
        Self {
            key,
            kind,
            synthetic: false,
            new_value,
            origin: Some(origin),
        }
    }

    /// Event produced by the store itself (expiry, eviction, load).
    pub fn synthetic(key: K, kind: EventKind, new_value: Option<V>) -> Self {
        Self {
            key,
            kind,
            synthetic: true,
            new_value,
            origin: None,
        }
    }

    /// Whether the given client can prove it caused this change.
    ///
    /// Only non-synthetic inserts and updates stamped with the client's own
    /// identity qualify; deletes always invalidate.
    pub fn is_attributable_to(&self, client: ClientId) -> bool {
        !self.synthetic
            && matches!(self.kind, EventKind::Insert | EventKind::Update)
            && self.origin == Some(client)
    }
}
