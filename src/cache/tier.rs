//! The in-process L1 tier.
//!
//! A sharded map bounded by entry count. When an insert pushes it over the
//! bound, the least-recently-used entry is evicted (ties go to the entry
//! with the fewest accesses).

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use dashmap::DashMap;
use time::OffsetDateTime;

use super::entry::CacheEntry;
use super::keys::CacheKey;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::tier";

/// One level of the cache hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Fast, size-bounded, process-local.
    L1,
    /// Durable, larger, slower.
    L2,
    /// Remote-simulated, largest, slowest.
    L3,
}

impl Tier {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::L1 => "l1",
            Self::L2 => "l2",
            Self::L3 => "l3",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an L1 probe.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Lookup<T> {
    Hit(T),
    /// An entry was present but expired; it has been removed.
    Expired,
    Absent,
}

pub(crate) struct L1Tier<T> {
    entries: DashMap<CacheKey, CacheEntry<T>>,
    max_entries: NonZeroUsize,
    // Serializes victim selection so concurrent inserts never over-evict.
    eviction: Mutex<()>,
}

impl<T: Clone> L1Tier<T> {
    pub fn new(max_entries: NonZeroUsize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
            eviction: Mutex::new(()),
        }
    }

    /// Probe for `key`, recording the access on a hit.
    pub fn lookup(&self, key: &CacheKey) -> Lookup<T> {
        match self.entries.get_mut(key) {
            None => return Lookup::Absent,
            Some(mut entry) if !entry.is_expired() => {
                entry.record_access();
                return Lookup::Hit(CacheEntry::value(&entry).clone());
            }
            Some(_) => {}
        }

        // Re-check under the removal lock in case a writer refreshed the
        // entry after the shard guard above was released.
        match self.entries.remove_if(key, |_, entry| entry.is_expired()) {
            Some(_) => Lookup::Expired,
            None => self.lookup(key),
        }
    }

    /// Read a live value without touching access bookkeeping.
    pub fn peek(&self, key: &CacheKey) -> Option<T> {
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| CacheEntry::value(&entry).clone())
    }

    /// Insert or replace an entry; returns the keys evicted to respect the bound.
    pub fn insert(&self, entry: CacheEntry<T>) -> Vec<CacheKey> {
        let key = entry.key().clone();
        self.entries.insert(key.clone(), entry);

        if self.entries.len() <= self.max_entries.get() {
            return Vec::new();
        }

        let _guard = mutex_lock(&self.eviction, SOURCE, "insert.evict");
        let mut evicted = Vec::new();
        while self.entries.len() > self.max_entries.get() {
            let Some(victim) = self.least_recently_used(&key) else {
                break;
            };
            if self.entries.remove(&victim).is_some() {
                evicted.push(victim);
            }
        }
        evicted
    }

    // The entry that triggered eviction is only chosen when nothing else is left.
    fn least_recently_used(&self, protect: &CacheKey) -> Option<CacheKey> {
        self.entries
            .iter()
            .filter(|entry| entry.key() != protect)
            .min_by_key(|entry| {
                let value = entry.value();
                (value.last_accessed_at(), value.access_count())
            })
            .map(|entry| entry.key().clone())
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every expired entry, one key at a time.
    pub fn sweep_expired(&self) -> Vec<CacheKey> {
        let now = OffsetDateTime::now_utc();
        let candidates: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|entry| entry.value().is_expired_at(now))
            .map(|entry| entry.key().clone())
            .collect();

        candidates
            .into_iter()
            .filter(|key| {
                self.entries
                    .remove_if(key, |_, entry| entry.is_expired())
                    .is_some()
            })
            .collect()
    }

    #[cfg(test)]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Inspect an entry in place.
    pub fn with_entry<R>(
        &self,
        key: &CacheKey,
        f: impl FnOnce(&CacheEntry<T>) -> R,
    ) -> Option<R> {
        self.entries.get(key).map(|entry| f(entry.value()))
    }

    pub fn with_entry_mut<R>(
        &self,
        key: &CacheKey,
        f: impl FnOnce(&mut CacheEntry<T>) -> R,
    ) -> Option<R> {
        self.entries.get_mut(key).map(|mut entry| f(entry.value_mut()))
    }
}
