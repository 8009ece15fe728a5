//! The multi-level cache manager.
//!
//! Lookups walk L1 → L2 → L3 and promote hits upward. Writes land in L1
//! synchronously and reach the lower tiers through the write-behind workers.
//! `get_or_compute` runs at most one producer per key at a time, and
//! `invalidate` cascades through the dependency graph.
//!
//! Reads, computations and queued writes that overlap an invalidation of
//! their key never repopulate any tier: each is stamped with the key's
//! generation before it starts and only caches while the stamp is current.

use std::any::Any;
use std::collections::HashSet;
use std::error::Error as StdError;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::change::ChangeDetectionEngine;
use super::config::CacheConfig;
use super::entry::{CacheEntry, PersistedEntry};
use super::error::{CacheError, ComputeError};
use super::flight::{self, InFlight, Role};
use super::generation::{Generations, Stamp};
use super::keys::{CacheKey, Fingerprint};
use super::lock::mutex_lock;
use super::registry::Dependency;
use super::stats::{
    CacheStatistics, METRIC_COMPUTE_MS, METRIC_CORRUPT_ENTRY, METRIC_L1_ENTRIES, StatsSnapshot,
};
use super::store::{DurableStore, MemoryStore};
use super::sweeper::{self, Sweeper};
use super::tier::{L1Tier, Lookup, Tier};
use super::writer::{self, ALL_LOWER, L2_ONLY, LowerTiers, TierStore, WriteBehind};

const SOURCE: &str = "cache::manager";

/// External producer of cache values, invoked on a true miss.
#[async_trait]
pub trait Producer<T>: Send + Sync {
    type Error: StdError + Send + Sync + 'static;

    async fn produce(&self, key: &CacheKey) -> Result<T, Self::Error>;
}

/// Why a lower-tier record could not be used.
#[derive(Debug, Error)]
enum Corruption {
    #[error("undecodable record: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("record belongs to `{0}`")]
    KeyMismatch(CacheKey),
    #[error("creation timestamp out of range")]
    Timestamp,
}

/// Three-tier cache over values of type `T`.
pub struct MultiLevelCacheManager<T> {
    config: CacheConfig,
    l1: Arc<L1Tier<T>>,
    tiers: Arc<LowerTiers>,
    stats: Arc<CacheStatistics>,
    changes: ChangeDetectionEngine,
    flights: InFlight<T>,
    generations: Arc<Generations>,
    writer: WriteBehind<T>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl<T> MultiLevelCacheManager<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Build a manager over the given L2 and L3 stores.
    ///
    /// Stores for tiers disabled in `config` are ignored. Spawns the
    /// write-behind worker (and the expiry sweeper when `auto_cleanup` is
    /// set), so this must be called from within a tokio runtime.
    pub fn new(config: CacheConfig, l2: Arc<dyn DurableStore>, l3: Arc<dyn DurableStore>) -> Self {
        let tiers = Arc::new(LowerTiers {
            l2: config
                .enable_l2
                .then(|| TierStore::new(Tier::L2, l2, config.l2_key_prefix.clone())),
            l3: config
                .enable_l3
                .then(|| TierStore::new(Tier::L3, l3, config.l3_key_prefix.clone())),
        });
        let l1 = Arc::new(L1Tier::new(config.l1_max_entries_non_zero()));
        let stats = Arc::new(CacheStatistics::new());
        let generations = Arc::new(Generations::new());

        let sweeper = config.auto_cleanup.then(|| {
            Sweeper::spawn(
                Arc::downgrade(&l1),
                Arc::clone(&stats),
                config.cleanup_interval(),
            )
        });

        info!(
            l1_max_entries = config.l1_max_entries,
            l2 = tiers.l2.as_ref().map(|t| t.store.name()),
            l3 = tiers.l3.as_ref().map(|t| t.store.name()),
            auto_cleanup = config.auto_cleanup,
            "Cache manager started"
        );

        Self {
            writer: WriteBehind::spawn(
                Arc::clone(&tiers),
                Arc::clone(&generations),
                config.write_queue_capacity_non_zero(),
            ),
            flights: InFlight::new(),
            generations,
            changes: ChangeDetectionEngine::new(),
            sweeper: Mutex::new(sweeper),
            config,
            l1,
            tiers,
            stats,
        }
    }

    /// Build a manager whose L2 and L3 are in-memory stores sized from `config`.
    pub fn in_memory(config: CacheConfig) -> Self {
        let l2 = Arc::new(MemoryStore::new("l2", config.l2_max_entries_non_zero()));
        let l3 = Arc::new(MemoryStore::new("l3", config.l3_max_entries_non_zero()));
        Self::new(config, l2, l3)
    }

    /// Look `key` up in every tier, fastest first.
    ///
    /// `None` is a miss, not a failure: store errors and corrupt records are
    /// reported through logs and metrics and treated as misses.
    pub async fn get(&self, key: &CacheKey) -> Option<T> {
        let started = Instant::now();
        let stamp = self.generations.stamp(key);

        match self.l1.lookup(key) {
            Lookup::Hit(value) => {
                self.stats.record_l1_hit(started.elapsed());
                return Some(value);
            }
            Lookup::Expired => {
                debug!(key = %key, tier = "l1", "Dropped expired cache entry");
                self.stats.record_eviction(Tier::L1);
                self.update_l1_gauge();
            }
            Lookup::Absent => {}
        }

        if let Some(entry) = self.probe(Tier::L2, key).await {
            self.stats.record_l2_hit(started.elapsed());
            debug!(key = %key, tier = "l2", "Promoting cache entry");
            return Some(self.promote(entry, stamp));
        }

        if let Some(entry) = self.probe(Tier::L3, key).await {
            self.stats.record_l3_hit(started.elapsed());
            debug!(key = %key, tier = "l3", "Promoting cache entry");
            if self.generations.is_current(key, stamp) {
                self.writer.put(PersistedEntry::from_entry(&entry), stamp, L2_ONLY);
            }
            return Some(self.promote(entry, stamp));
        }

        self.stats.record_miss(started.elapsed());
        None
    }

    /// Store `value` in L1 and queue it for L2 and L3.
    ///
    /// Returns once L1 holds the entry; lower-tier failures are only logged.
    /// A `set` that overlaps an invalidation of the same key is dropped.
    pub fn set(&self, key: CacheKey, value: T, ttl: Option<Duration>) {
        let stamp = self.generations.stamp(&key);
        self.store(key, value, ttl, stamp);
    }

    /// Return the cached value for `key`, computing it on a miss.
    ///
    /// Concurrent callers for the same key share a single computation and
    /// observe the same value or the same failure. Failures are not cached.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: &CacheKey,
        compute: F,
    ) -> Result<T, CacheError>
    where
        F: FnOnce(CacheKey) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        let stamp = self.generations.stamp(key);
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }

        let guard = loop {
            match self.flights.join(key) {
                Role::Leader(guard) => break guard,
                Role::Follower(slot) => {
                    if let Some(outcome) = flight::wait(slot).await {
                        return outcome.map_err(|source| CacheError::Compute {
                            key: key.clone(),
                            source,
                        });
                    }
                    debug!("Computation abandoned by its leader; retrying");
                }
            }
        };

        // A flight that finished between our miss and joining has filled L1.
        if let Some(value) = self.l1.peek(key) {
            guard.complete(Ok(value.clone()));
            return Ok(value);
        }

        let started = Instant::now();
        let outcome = compute(key.clone())
            .await
            .map_err(|err| ComputeError::from_boxed(err.into()));
        histogram!(METRIC_COMPUTE_MS).record(started.elapsed().as_secs_f64() * 1000.0);

        match &outcome {
            Ok(value) => self.store(key.clone(), value.clone(), None, stamp),
            Err(err) => warn!(error = %err, "Cache computation failed"),
        }
        guard.complete(outcome.clone());

        outcome.map_err(|source| CacheError::Compute {
            key: key.clone(),
            source,
        })
    }

    /// [`Self::get_or_compute`] with a [`Producer`] collaborator.
    pub async fn get_or_produce<P>(&self, key: &CacheKey, producer: &P) -> Result<T, CacheError>
    where
        P: Producer<T> + ?Sized,
    {
        self.get_or_compute(key, |key| async move { producer.produce(&key).await })
            .await
    }

    /// Remove `key` from every tier along with everything derived from it.
    ///
    /// Returns how many keys were invalidated. Each key is visited at most
    /// once per call, so cycles in the dependency graph terminate.
    pub async fn invalidate(&self, key: &CacheKey) -> usize {
        self.invalidate_all([key.clone()]).await
    }

    /// Record that `dependent` was derived from the cached `dependency`.
    pub fn add_dependency(&self, dependent: &CacheKey, dependency: &CacheKey) {
        self.changes
            .dependencies()
            .register(dependent.clone(), Dependency::Entry(dependency.clone()));
    }

    /// Record that `key` was derived from the external input `source`.
    pub fn add_source_dependency(&self, key: &CacheKey, source: impl Into<String>) {
        self.changes
            .dependencies()
            .register(key.clone(), Dependency::source(source));
    }

    /// Remember the current content of `source` without invalidating anything.
    pub fn track_source(
        &self,
        source: impl Into<String>,
        content: impl AsRef<[u8]>,
    ) -> Fingerprint {
        self.changes.track_content(source, content)
    }

    /// Compare `content` with what was last seen for `source`.
    ///
    /// When it changed, the new fingerprint is tracked and every key derived
    /// from `source` is invalidated transitively. Returns the number of keys
    /// invalidated.
    pub async fn refresh_source(&self, source: &str, content: impl AsRef<[u8]>) -> usize {
        if !self.changes.has_content_changed(source, &content) {
            return 0;
        }
        self.changes.track_content(source, content);

        let affected = self
            .changes
            .dependencies()
            .remove_dependency(&Dependency::source(source));
        if affected.is_empty() {
            return 0;
        }
        let invalidated = self.invalidate_all(affected).await;
        info!(source, invalidated, "Source changed; invalidated dependents");
        invalidated
    }

    /// Run one expiry pass over L1; returns the number of entries removed.
    pub fn sweep_expired(&self) -> usize {
        sweeper::sweep_expired(&self.l1, &self.stats)
    }

    /// Wait until every lower-tier write queued so far has been applied.
    pub async fn flush(&self) {
        if !self.writer.flush().await {
            debug!("Write-behind stopped; nothing to flush");
        }
    }

    /// Empty L1 and the dependency graph. L2 and L3 are left intact.
    pub fn clear(&self) {
        self.l1.clear();
        self.changes.dependencies().clear();
        self.update_l1_gauge();
    }

    /// Attach diagnostic metadata to the L1 entry for `key`.
    ///
    /// Returns false when L1 does not hold the key. Metadata is not carried
    /// to the lower tiers.
    pub fn annotate<M>(&self, key: &CacheKey, name: impl Into<String>, value: M) -> bool
    where
        M: Any + Send + Sync,
    {
        self.l1
            .with_entry_mut(key, |entry| entry.add_metadata(name, value))
            .is_some()
    }

    /// Inspect the L1 entry for `key` without recording an access.
    pub fn inspect<R>(&self, key: &CacheKey, f: impl FnOnce(&CacheEntry<T>) -> R) -> Option<R> {
        self.l1.with_entry(key, f)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn statistics(&self) -> Arc<CacheStatistics> {
        Arc::clone(&self.stats)
    }

    pub fn l1_len(&self) -> usize {
        self.l1.len()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn change_detector(&self) -> &ChangeDetectionEngine {
        &self.changes
    }

    /// Stop background work. Pending lower-tier writes are flushed first.
    pub async fn shutdown(&self) {
        if let Some(sweeper) = mutex_lock(&self.sweeper, SOURCE, "shutdown").take() {
            sweeper.stop();
        }
        self.flush().await;
        self.writer.stop();
        info!(stats = %self.stats.snapshot(), "Cache manager stopped");
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn probe(&self, tier: Tier, key: &CacheKey) -> Option<CacheEntry<T>> {
        let store = self.tiers.get(tier)?;
        let storage_key = store.storage_key(key);

        let bytes = match store.store.get(&storage_key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(err) => {
                writer::report_store_failure(store, "get", &err);
                return None;
            }
        };

        match decode::<T>(key, &bytes) {
            Ok(entry) if !entry.is_expired() => Some(entry),
            Ok(_) => {
                debug!(key = %key, tier = %tier, "Dropped expired cache entry");
                self.discard(store, &storage_key).await;
                None
            }
            Err(reason) => {
                warn!(key = %key, tier = %tier, error = %reason, "Corrupt cache entry");
                counter!(METRIC_CORRUPT_ENTRY, "tier" => tier.as_str()).increment(1);
                self.discard(store, &storage_key).await;
                None
            }
        }
    }

    async fn discard(&self, store: &TierStore, storage_key: &str) {
        match store.store.delete(storage_key).await {
            Ok(true) => self.stats.record_eviction(store.tier),
            Ok(false) => {}
            Err(err) => writer::report_store_failure(store, "delete", &err),
        }
    }

    /// Cache a fresh value in every tier unless `key` was invalidated after
    /// `stamp` was taken.
    fn store(&self, key: CacheKey, value: T, ttl: Option<Duration>, stamp: Stamp) {
        if !self.generations.is_current(&key, stamp) {
            debug!(key = %key, "Not caching value overtaken by invalidation");
            return;
        }
        let ttl = ttl.unwrap_or_else(|| self.config.default_ttl());
        let entry = CacheEntry::create(key, value, Some(ttl));
        if self.tiers.iter().next().is_some() {
            self.writer.put(PersistedEntry::from_entry(&entry), stamp, ALL_LOWER);
        }
        self.insert_l1_stamped(entry, stamp);
    }

    fn promote(&self, mut entry: CacheEntry<T>, stamp: Stamp) -> T {
        entry.record_access();
        let value = entry.value().clone();
        self.insert_l1_stamped(entry, stamp);
        value
    }

    fn insert_l1_stamped(&self, entry: CacheEntry<T>, stamp: Stamp) {
        let key = entry.key().clone();
        if !self.generations.is_current(&key, stamp) {
            return;
        }
        self.insert_l1(entry);
        // An invalidation that started after the check above may already
        // have cleared L1.
        if !self.generations.is_current(&key, stamp) && self.l1.remove(&key) {
            debug!(key = %key, "Retracted L1 entry raced by invalidation");
            self.update_l1_gauge();
        }
    }

    fn insert_l1(&self, entry: CacheEntry<T>) {
        for victim in self.l1.insert(entry) {
            debug!(key = %victim, "Evicted least-recently-used entry from L1");
            self.stats.record_eviction(Tier::L1);
        }
        self.update_l1_gauge();
    }

    async fn invalidate_all(&self, roots: impl IntoIterator<Item = CacheKey>) -> usize {
        let graph = self.changes.dependencies();
        let mut visited = HashSet::new();
        let mut pending: Vec<CacheKey> = roots.into_iter().collect();

        while let Some(key) = pending.pop() {
            if !visited.insert(key.clone()) {
                continue;
            }
            pending.extend(
                graph
                    .dependents_of(&Dependency::Entry(key.clone()))
                    .into_iter()
                    .filter(|dependent| !visited.contains(dependent)),
            );
            graph.unregister(&key);
            self.evict_everywhere(&key).await;
        }

        if visited.len() > 1 {
            info!(invalidated = visited.len(), "Cascading invalidation finished");
        }
        visited.len()
    }

    async fn evict_everywhere(&self, key: &CacheKey) {
        let _invalidating = self.generations.begin(key);
        if self.l1.remove(key) {
            self.stats.record_eviction(Tier::L1);
            self.update_l1_gauge();
        }

        for tier in writer::delete_key(&self.tiers, key).await {
            self.stats.record_eviction(tier);
        }
        debug!(key = %key, "Invalidated cache entry");
    }

    fn update_l1_gauge(&self) {
        gauge!(METRIC_L1_ENTRIES).set(self.l1.len() as f64);
    }
}

fn decode<T: DeserializeOwned>(key: &CacheKey, bytes: &[u8]) -> Result<CacheEntry<T>, Corruption> {
    let record: PersistedEntry<T> = serde_json::from_slice(bytes)?;
    if record.key != *key {
        return Err(Corruption::KeyMismatch(record.key));
    }
    record.into_entry().ok_or(Corruption::Timestamp)
}
