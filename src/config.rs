//! Engine Configuration
//!
//! A fixed set of named options resolved once when the engine is built.
//! Can be loaded from YAML; every field has a default.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::near::InvalidationStrategy;

/// Near cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Which back-store notifications the engine subscribes to
    pub strategy: InvalidationStrategy,
    /// Lock wait for populates and writes (0 = no wait, negative = forever)
    pub lock_timeout_ms: i64,
    /// Maximum keys per batched back-store fetch
    pub batch_size: usize,
    /// Remember keys the back store has no mapping for
    pub cache_misses: bool,
    /// How often parked lock waiters re-check owner liveness
    pub liveness_probe_interval_ms: u64,
    /// Number of control-map stripes (power of two)
    pub lock_stripes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strategy: InvalidationStrategy::Present,
            lock_timeout_ms: -1,
            batch_size: 256,
            cache_misses: false,
            liveness_probe_interval_ms: 100,
            lock_stripes: crate::near::DEFAULT_LOCK_STRIPES,
        }
    }
}

impl EngineConfig {
    /// Parse a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    /// Reject option combinations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".to_string()));
        }
        if self.liveness_probe_interval_ms == 0 {
            return Err(Error::Config(
                "liveness_probe_interval_ms must be at least 1".to_string(),
            ));
        }
        if self.lock_stripes == 0 || !self.lock_stripes.is_power_of_two() {
            return Err(Error::Config(format!(
                "lock_stripes must be a power of two, got {}",
                self.lock_stripes
            )));
        }
        Ok(())
    }

    pub fn liveness_probe_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_probe_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.strategy, InvalidationStrategy::Present);
        assert_eq!(config.lock_timeout_ms, -1);
    }

    #[test]
    fn test_parse_partial_yaml() {
        let config = EngineConfig::from_yaml_str(
            "strategy: logical\nbatch_size: 32\ncache_misses: true\n",
        )
        .unwrap();

        assert_eq!(config.strategy, InvalidationStrategy::Logical);
        assert_eq!(config.batch_size, 32);
        assert!(config.cache_misses);
        assert_eq!(config.lock_stripes, crate::near::DEFAULT_LOCK_STRIPES);
    }

    #[test]
    fn test_reject_bad_stripes() {
        let result = EngineConfig::from_yaml_str("lock_stripes: 12\n");
        assert_matches!(result, Err(Error::Config(_)));
    }

    #[test]
    fn test_reject_zero_batch() {
        let config = EngineConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_reject_unknown_strategy() {
        let result = EngineConfig::from_yaml_str("strategy: sometimes\n");
        assert_matches!(result, Err(Error::Yaml(_)));
    }
}
