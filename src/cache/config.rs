//! Cache configuration.
//!
//! Controls tier sizing, TTL defaults and the background expiry sweep via
//! the `[cache]` section of `tiercache.toml`.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

// Default values for cache configuration
const DEFAULT_L1_MAX_ENTRIES: usize = 1_000;
const DEFAULT_TTL_MS: u64 = 24 * 60 * 60 * 1_000;
const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 60_000;
const DEFAULT_L2_MAX_ENTRIES: usize = 10_000;
const DEFAULT_L3_MAX_ENTRIES: usize = 100_000;
const DEFAULT_WRITE_QUEUE_CAPACITY: usize = 10_000;
const DEFAULT_L2_KEY_PREFIX: &str = "l2:";
const DEFAULT_L3_KEY_PREFIX: &str = "l3:";

/// Cache configuration from `tiercache.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum entries held by the L1 tier before LRU eviction.
    pub l1_max_entries: usize,
    /// TTL (ms) applied when `set` is called without one.
    pub default_ttl_ms: u64,
    /// Run the background expiry sweep.
    pub auto_cleanup: bool,
    /// Interval (ms) between background sweeps.
    pub cleanup_interval_ms: u64,
    /// Use the durable L2 tier.
    pub enable_l2: bool,
    /// Use the remote-simulated L3 tier.
    pub enable_l3: bool,
    /// Capacity of an in-memory L2 store.
    pub l2_max_entries: usize,
    /// Capacity of an in-memory L3 store.
    pub l3_max_entries: usize,
    /// Pending write-behind operations per lower tier before writes are dropped.
    pub write_queue_capacity: usize,
    /// Prefix prepended to storage ids written to L2.
    pub l2_key_prefix: String,
    /// Prefix prepended to storage ids written to L3.
    pub l3_key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_max_entries: DEFAULT_L1_MAX_ENTRIES,
            default_ttl_ms: DEFAULT_TTL_MS,
            auto_cleanup: true,
            cleanup_interval_ms: DEFAULT_CLEANUP_INTERVAL_MS,
            enable_l2: true,
            enable_l3: true,
            l2_max_entries: DEFAULT_L2_MAX_ENTRIES,
            l3_max_entries: DEFAULT_L3_MAX_ENTRIES,
            write_queue_capacity: DEFAULT_WRITE_QUEUE_CAPACITY,
            l2_key_prefix: DEFAULT_L2_KEY_PREFIX.to_string(),
            l3_key_prefix: DEFAULT_L3_KEY_PREFIX.to_string(),
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    /// Sweep interval, clamped to at least one millisecond.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms.max(1))
    }

    /// Returns the L1 bound as NonZeroUsize, clamping to 1 if zero.
    pub fn l1_max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.l1_max_entries).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns the in-memory L2 capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn l2_max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.l2_max_entries).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns the in-memory L3 capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn l3_max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.l3_max_entries).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn write_queue_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.write_queue_capacity).unwrap_or(NonZeroUsize::MIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.l1_max_entries, 1_000);
        assert_eq!(config.default_ttl(), Duration::from_secs(24 * 60 * 60));
        assert!(config.auto_cleanup);
        assert_eq!(config.cleanup_interval(), Duration::from_secs(60));
        assert!(config.enable_l2);
        assert!(config.enable_l3);
        assert_eq!(config.l2_key_prefix, "l2:");
        assert_eq!(config.l3_key_prefix, "l3:");
        assert_eq!(config.write_queue_capacity, 10_000);
    }

    #[test]
    fn non_zero_clamps_to_min() {
        let config = CacheConfig {
            l1_max_entries: 0,
            l2_max_entries: 0,
            write_queue_capacity: 0,
            cleanup_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.l1_max_entries_non_zero().get(), 1);
        assert_eq!(config.l2_max_entries_non_zero().get(), 1);
        assert_eq!(config.write_queue_capacity_non_zero().get(), 1);
        assert_eq!(config.cleanup_interval(), Duration::from_millis(1));
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let config = from_json(r#"{ "l1_max_entries": 8, "auto_cleanup": false }"#);
        assert_eq!(config.l1_max_entries, 8);
        assert!(!config.auto_cleanup);
        assert_eq!(config.default_ttl_ms, DEFAULT_TTL_MS);
    }

    fn from_json(json: &str) -> CacheConfig {
        serde_json::from_str(json).expect("config deserializes")
    }
}
