//! Tiercache Cache System
//!
//! Memoizes expensive derived artifacts across three tiers:
//!
//! - **L1**: in-process, bounded by entry count, LRU eviction
//! - **L2**: durable store (filesystem or in-memory)
//! - **L3**: remote-simulated store with its own latency profile
//!
//! Hits in a slower tier are promoted upward, writes go to L1 first and
//! reach the lower tiers through write-behind workers, and invalidation
//! cascades through a dependency graph of keys and external sources.
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `tiercache.toml`:
//!
//! ```toml
//! [cache]
//! l1_max_entries = 1000
//! default_ttl_ms = 86400000
//! auto_cleanup = true
//! cleanup_interval_ms = 60000
//! # ... see config.rs for all options
//! ```

mod change;
mod config;
mod entry;
mod error;
mod flight;
mod generation;
mod keys;
mod lock;
mod manager;
mod registry;
mod stats;
mod store;
mod sweeper;
mod tier;
mod writer;

pub use change::ChangeDetectionEngine;
pub use config::CacheConfig;
pub use entry::{CacheEntry, DEFAULT_TTL};
pub use error::{CacheError, ComputeError, StoreError};
pub use keys::{CacheKey, Fingerprint, SchemaVersion};
pub use manager::{MultiLevelCacheManager, Producer};
pub use registry::{Dependency, DependencyRegistry};
pub use stats::{CacheStatistics, StatsSnapshot};
pub(crate) use stats::{
    METRIC_COMPUTE_MS, METRIC_CORRUPT_ENTRY, METRIC_EVICT, METRIC_L1_ENTRIES, METRIC_L1_HIT,
    METRIC_L2_HIT, METRIC_L3_HIT, METRIC_MISS, METRIC_STORE_FAILURE,
};
pub use store::{DurableStore, FsStore, MemoryStore};
pub use tier::Tier;
