//! Configuration for the data cache

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the cache frees room when it is over capacity
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Only purge expired entries; reject the store if that is not enough
    ExpireOnly,
    /// Evict least-recently-used entries, expired or not
    LruOnly,
    /// Purge expired entries first, then fall back to LRU
    #[default]
    ExpireThenLru,
}

/// Configuration for the data cache
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL applied when `store` is called without one
    pub default_ttl_ms: u64,

    /// Entry count ceiling
    pub max_entries: usize,

    /// Total payload size ceiling in bytes
    pub max_size_bytes: usize,

    /// Period of the background expiry sweep
    pub sweep_interval_secs: u64,

    /// Eviction policy under capacity pressure
    pub eviction_policy: EvictionPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 300_000,
            max_entries: 1000,
            max_size_bytes: 100 * 1024 * 1024,
            sweep_interval_secs: 60,
            eviction_policy: EvictionPolicy::ExpireThenLru,
        }
    }
}

impl CacheConfig {
    /// Set the default TTL
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl_ms = ttl.as_millis() as u64;
        self
    }

    /// Set the entry count ceiling
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Set the total size ceiling
    pub fn with_max_size_bytes(mut self, max_size_bytes: usize) -> Self {
        self.max_size_bytes = max_size_bytes;
        self
    }

    /// Set the eviction policy
    pub fn with_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = policy;
        self
    }

    /// Set the sweep period
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_secs = interval.as_secs().max(1);
        self
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.default_ttl_ms == 0 {
            return Err("cache.default_ttl_ms must be greater than zero".to_string());
        }
        if self.max_entries == 0 {
            return Err("cache.max_entries must be greater than zero".to_string());
        }
        if self.max_size_bytes == 0 {
            return Err("cache.max_size_bytes must be greater than zero".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.default_ttl(), Duration::from_secs(300));
        assert_eq!(config.eviction_policy, EvictionPolicy::ExpireThenLru);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sub_second_ttl_is_kept() {
        let config = CacheConfig::default().with_default_ttl(Duration::from_millis(250));
        assert_eq!(config.default_ttl(), Duration::from_millis(250));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = CacheConfig::default().with_max_entries(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_policy_deserializes_snake_case() {
        let config: CacheConfig = toml::from_str("eviction_policy = \"lru_only\"").unwrap();
        assert_eq!(config.eviction_policy, EvictionPolicy::LruOnly);
        assert_eq!(config.max_entries, 1000);
    }
}
