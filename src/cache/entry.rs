//! Cache entries: a value plus its lifecycle bookkeeping.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::keys::CacheKey;

/// Time-to-live applied when the caller does not specify one.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

type MetadataValue = Box<dyn Any + Send + Sync>;

/// A cached value with creation/access timestamps, counters and metadata.
pub struct CacheEntry<T> {
    key: CacheKey,
    value: T,
    created_at: OffsetDateTime,
    last_accessed_at: OffsetDateTime,
    time_to_live: Duration,
    access_count: u64,
    metadata: HashMap<String, MetadataValue>,
}

impl<T> CacheEntry<T> {
    /// Create a fresh entry; `ttl` falls back to [`DEFAULT_TTL`].
    pub fn create(key: CacheKey, value: T, ttl: Option<Duration>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            key,
            value,
            created_at: now,
            last_accessed_at: now,
            time_to_live: ttl.unwrap_or(DEFAULT_TTL),
            access_count: 0,
            metadata: HashMap::new(),
        }
    }

    /// Rebuild an entry that was persisted by a slower tier.
    pub(crate) fn restore(
        key: CacheKey,
        value: T,
        created_at: OffsetDateTime,
        time_to_live: Duration,
        access_count: u64,
    ) -> Self {
        Self {
            key,
            value,
            created_at,
            last_accessed_at: OffsetDateTime::now_utc(),
            time_to_live,
            access_count,
            metadata: HashMap::new(),
        }
    }

    /// Bump the access timestamp and counter. Hot-path safe: no allocation.
    pub fn record_access(&mut self) {
        self.last_accessed_at = self.last_accessed_at.max(OffsetDateTime::now_utc());
        self.access_count = self.access_count.saturating_add(1);
    }

    #[cfg(test)]
    pub(crate) fn set_last_accessed_at(&mut self, at: OffsetDateTime) {
        self.last_accessed_at = at;
    }

    pub fn add_metadata<M>(&mut self, key: impl Into<String>, value: M)
    where
        M: Any + Send + Sync,
    {
        self.metadata.insert(key.into(), Box::new(value));
    }

    /// Typed metadata lookup.
    ///
    /// Returns `None` both when the key is missing and when the stored value
    /// is of a different type; metadata is best-effort diagnostic data.
    pub fn metadata<M: Any>(&self, key: &str) -> Option<&M> {
        self.metadata.get(key)?.downcast_ref::<M>()
    }

    pub fn metadata_len(&self) -> usize {
        self.metadata.len()
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        exceeds(now - self.created_at, self.time_to_live)
    }

    /// True when the entry has not been read for longer than `max_age`.
    pub fn is_stale(&self, max_age: Duration) -> bool {
        exceeds(OffsetDateTime::now_utc() - self.last_accessed_at, max_age)
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    pub fn last_accessed_at(&self) -> OffsetDateTime {
        self.last_accessed_at
    }

    pub fn time_to_live(&self) -> Duration {
        self.time_to_live
    }

    pub fn access_count(&self) -> u64 {
        self.access_count
    }
}

// Negative elapsed time (clock stepped backwards) never counts as exceeded.
fn exceeds(elapsed: time::Duration, limit: Duration) -> bool {
    elapsed.whole_nanoseconds() > limit.as_nanos() as i128
}

impl<T: fmt::Debug> fmt::Debug for CacheEntry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("value", &self.value)
            .field("created_at", &self.created_at)
            .field("last_accessed_at", &self.last_accessed_at)
            .field("time_to_live", &self.time_to_live)
            .field("access_count", &self.access_count)
            .field("metadata_keys", &self.metadata.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Wire form of an entry as written to the durable and remote tiers.
///
/// Timestamps travel as unix milliseconds so the TTL keeps counting from the
/// original creation time after a promotion.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct PersistedEntry<V> {
    pub key: CacheKey,
    pub value: V,
    pub created_at_ms: i64,
    pub ttl_ms: u64,
    pub access_count: u64,
}

impl<T: Clone> PersistedEntry<T> {
    pub fn from_entry(entry: &CacheEntry<T>) -> Self {
        Self {
            key: entry.key.clone(),
            value: entry.value.clone(),
            created_at_ms: (entry.created_at.unix_timestamp_nanos() / 1_000_000) as i64,
            ttl_ms: u64::try_from(entry.time_to_live.as_millis()).unwrap_or(u64::MAX),
            access_count: entry.access_count,
        }
    }
}

impl<T> PersistedEntry<T> {
    /// Convert back into a live entry; `None` if the timestamp is out of range.
    pub fn into_entry(self) -> Option<CacheEntry<T>> {
        let created_at =
            OffsetDateTime::from_unix_timestamp_nanos(i128::from(self.created_at_ms) * 1_000_000)
                .ok()?;
        Some(CacheEntry::restore(
            self.key,
            self.value,
            created_at,
            Duration::from_millis(self.ttl_ms),
            self.access_count,
        ))
    }
}
