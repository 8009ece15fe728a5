//! Key/value store collaborators backing the L2 and L3 tiers.
//!
//! The manager only needs `put`/`get`/`delete` over opaque bytes; how a
//! store persists them is its own business. Two implementations ship here:
//! an LRU-bounded in-memory store with optional simulated latency, and a
//! directory-per-store filesystem store.

use std::io::ErrorKind;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use sha2::{Digest, Sha256};

use super::error::StoreError;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::store";

/// Abstract byte store used to realize a slower cache tier.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Short human-readable name used in logs.
    fn name(&self) -> &str;

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Remove `key`; returns whether it was present.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
}

// ============================================================================
// In-memory store
// ============================================================================

/// LRU-bounded in-memory store.
///
/// `latency` and `jitter` simulate a slower medium: each call sleeps for
/// `latency` plus a key-dependent share of `jitter`. Failure injection makes
/// every call return [`StoreError::Unavailable`].
pub struct MemoryStore {
    name: String,
    entries: Mutex<LruCache<String, Vec<u8>>>,
    latency: Duration,
    jitter: Duration,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>, capacity: NonZeroUsize) -> Self {
        Self {
            name: name.into(),
            entries: Mutex::new(LruCache::new(capacity)),
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
            failing: AtomicBool::new(false),
        }
    }

    /// Add simulated latency to every operation.
    pub fn with_latency(mut self, latency: Duration, jitter: Duration) -> Self {
        self.latency = latency;
        self.jitter = jitter;
        self
    }

    /// Toggle failure injection.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "memory_len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        mutex_lock(&self.entries, SOURCE, "memory_contains").contains(key)
    }

    async fn simulate(&self, key: &str) -> Result<(), StoreError> {
        let delay = self.latency + self.jitter_for(key);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable(&self.name, "failure injected"));
        }
        Ok(())
    }

    fn jitter_for(&self, key: &str) -> Duration {
        let jitter_nanos = self.jitter.as_nanos();
        if jitter_nanos == 0 {
            return Duration::ZERO;
        }
        let digest = Sha256::digest(key.as_bytes());
        let mut leading = [0_u8; 8];
        leading.copy_from_slice(&digest[..8]);
        let spread = u128::from(u64::from_be_bytes(leading)) % jitter_nanos;
        Duration::from_nanos(u64::try_from(spread).unwrap_or(u64::MAX))
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.simulate(key).await?;
        mutex_lock(&self.entries, SOURCE, "memory_put").put(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.simulate(key).await?;
        Ok(mutex_lock(&self.entries, SOURCE, "memory_get")
            .get(key)
            .cloned())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.simulate(key).await?;
        Ok(mutex_lock(&self.entries, SOURCE, "memory_delete")
            .pop(key)
            .is_some())
    }
}

// ============================================================================
// Filesystem store
// ============================================================================

/// Stores each value in its own file under `root`.
///
/// File names are the hex SHA-256 of the key so arbitrary keys map to safe
/// paths. Writes go to a temporary file first and are renamed into place.
pub struct FsStore {
    name: String,
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            name: format!("fs:{}", root.display()),
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        self.root.join(hex::encode(hasher.finalize()))
    }
}

#[async_trait]
impl DurableStore for FsStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.path_for(key);
        let staging = path.with_extension("tmp");
        tokio::fs::write(&staging, bytes).await?;
        tokio::fs::rename(&staging, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}
