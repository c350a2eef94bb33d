//! Error types for the near cache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the near cache
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Key Lock Errors
    // =========================================================================
    /// The key lock could not be acquired within the caller's budget
    #[error("Timed out after {waited_ms}ms waiting for the lock on key {key}")]
    LockTimeout { key: String, waited_ms: u64 },

    /// The key lock table was cleared while the caller was waiting
    #[error("Wait for the lock on key {key} was interrupted by a table clear")]
    LockInterrupted { key: String },

    /// Lock bookkeeping for a key is inconsistent
    #[error("Corrupt lock state for key {key}: {reason}")]
    CorruptLockState { key: String, reason: String },

    // =========================================================================
    // Back Store Errors
    // =========================================================================
    /// The back store rejected or failed an operation
    #[error("Back store error: {0}")]
    BackStore(String),

    /// The back store is not reachable
    #[error("Back store unavailable")]
    BackStoreUnavailable,

    // =========================================================================
    // Lifecycle / Configuration Errors
    // =========================================================================
    /// The engine has been released and can no longer serve requests
    #[error("Near cache has been released")]
    Released,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML configuration parse error
    #[error("Failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(String),
}

impl From<prometheus::Error> for Error {
    fn from(e: prometheus::Error) -> Self {
        Error::Metrics(e.to_string())
    }
}

impl Error {
    /// Whether the failed operation may succeed if the caller tries again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::LockTimeout { .. } | Error::LockInterrupted { .. } | Error::BackStoreUnavailable
        )
    }

    pub(crate) fn lock_timeout<K: std::fmt::Debug>(key: &K, waited_ms: u64) -> Self {
        Error::LockTimeout {
            key: format!("{:?}", key),
            waited_ms,
        }
    }

    pub(crate) fn lock_interrupted<K: std::fmt::Debug>(key: &K) -> Self {
        Error::LockInterrupted {
            key: format!("{:?}", key),
        }
    }

    pub(crate) fn corrupt_lock<K: std::fmt::Debug>(key: &K, reason: impl Into<String>) -> Self {
        Error::CorruptLockState {
            key: format!("{:?}", key),
            reason: reason.into(),
        }
    }
}
