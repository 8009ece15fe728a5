//! Write-behind propagation to the lower tiers.
//!
//! `set` only touches L1 on the caller's path. Serialization and store
//! writes happen here, on one bounded queue per lower tier, so a slow L3
//! never holds back L2. Invalidation does not go through these queues: it
//! deletes directly and bumps the key's generation, and every queued write
//! re-checks that generation before and after it lands.

use std::num::NonZeroUsize;
use std::sync::Arc;

use futures::future::join_all;
use metrics::counter;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::entry::PersistedEntry;
use super::error::StoreError;
use super::generation::{Generations, Stamp};
use super::keys::CacheKey;
use super::stats::METRIC_STORE_FAILURE;
use super::store::DurableStore;
use super::tier::Tier;

/// A store bound to one tier together with its key namespace.
pub(crate) struct TierStore {
    pub tier: Tier,
    pub store: Arc<dyn DurableStore>,
    prefix: String,
}

impl TierStore {
    pub fn new(tier: Tier, store: Arc<dyn DurableStore>, prefix: impl Into<String>) -> Self {
        Self {
            tier,
            store,
            prefix: prefix.into(),
        }
    }

    pub fn storage_key(&self, key: &CacheKey) -> String {
        format!("{}{}", self.prefix, key.storage_id())
    }
}

/// The enabled tiers below L1.
#[derive(Default)]
pub(crate) struct LowerTiers {
    pub l2: Option<TierStore>,
    pub l3: Option<TierStore>,
}

impl LowerTiers {
    pub fn get(&self, tier: Tier) -> Option<&TierStore> {
        match tier {
            Tier::L1 => None,
            Tier::L2 => self.l2.as_ref(),
            Tier::L3 => self.l3.as_ref(),
        }
    }

    /// Enabled lower tiers, fastest first.
    pub fn iter(&self) -> impl Iterator<Item = &TierStore> {
        self.l2.iter().chain(self.l3.iter())
    }
}

pub(crate) const ALL_LOWER: &[Tier] = &[Tier::L2, Tier::L3];
pub(crate) const L2_ONLY: &[Tier] = &[Tier::L2];

/// Log and count a store failure. Store failures never reach callers.
pub(crate) fn report_store_failure(tier: &TierStore, operation: &'static str, err: &StoreError) {
    warn!(
        tier = %tier.tier,
        store = tier.store.name(),
        operation,
        error = %err,
        "Cache store operation failed"
    );
    counter!(METRIC_STORE_FAILURE, "tier" => tier.tier.as_str()).increment(1);
}

enum WriteOp<T> {
    Put {
        record: Arc<PersistedEntry<T>>,
        stamp: Stamp,
    },
    Flush(oneshot::Sender<()>),
}

/// One tier's queue and the task draining it.
struct Queue<T> {
    tier: Tier,
    sender: mpsc::Sender<WriteOp<T>>,
    handle: JoinHandle<()>,
}

/// Handle to the background writers, one per enabled lower tier.
pub(crate) struct WriteBehind<T> {
    tiers: Arc<LowerTiers>,
    queues: Vec<Queue<T>>,
}

impl<T> WriteBehind<T>
where
    T: Serialize + Send + Sync + 'static,
{
    /// Spawn one writer per enabled tier on the current tokio runtime.
    pub fn spawn(
        tiers: Arc<LowerTiers>,
        generations: Arc<Generations>,
        capacity: NonZeroUsize,
    ) -> Self {
        let queues = tiers
            .iter()
            .map(|store| {
                let (sender, receiver) = mpsc::channel(capacity.get());
                let handle = tokio::spawn(run(
                    Arc::clone(&tiers),
                    store.tier,
                    Arc::clone(&generations),
                    receiver,
                ));
                Queue {
                    tier: store.tier,
                    sender,
                    handle,
                }
            })
            .collect();
        Self { tiers, queues }
    }

    /// Queue a record for the given tiers. Disabled tiers are skipped.
    ///
    /// The write is dropped, and counted as a store failure, when a tier's
    /// queue is full.
    pub fn put(&self, record: PersistedEntry<T>, stamp: Stamp, targets: &[Tier]) {
        let record = Arc::new(record);
        for queue in self.queues.iter().filter(|q| targets.contains(&q.tier)) {
            let op = WriteOp::Put {
                record: Arc::clone(&record),
                stamp,
            };
            match queue.sender.try_send(op) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    if let Some(store) = self.tiers.get(queue.tier) {
                        let err = StoreError::unavailable(store.store.name(), "write queue full");
                        report_store_failure(store, "enqueue", &err);
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(
                        key = %record.key,
                        tier = %queue.tier,
                        "Write-behind stopped; dropping lower-tier write"
                    );
                }
            }
        }
    }

    /// Wait until every operation queued so far has been applied.
    ///
    /// Returns false when a writer has stopped.
    pub async fn flush(&self) -> bool {
        let mut pending = Vec::with_capacity(self.queues.len());
        for queue in &self.queues {
            let (reply, done) = oneshot::channel();
            if queue.sender.send(WriteOp::Flush(reply)).await.is_err() {
                return false;
            }
            pending.push(done);
        }
        join_all(pending).await.iter().all(Result::is_ok)
    }

    pub fn stop(&self) {
        for queue in &self.queues {
            queue.handle.abort();
        }
    }
}

impl<T> Drop for WriteBehind<T> {
    fn drop(&mut self) {
        for queue in &self.queues {
            queue.handle.abort();
        }
    }
}

async fn run<T: Serialize>(
    tiers: Arc<LowerTiers>,
    tier: Tier,
    generations: Arc<Generations>,
    mut receiver: mpsc::Receiver<WriteOp<T>>,
) {
    let Some(store) = tiers.get(tier) else {
        return;
    };
    while let Some(op) = receiver.recv().await {
        match op {
            WriteOp::Put { record, stamp } => {
                write_record(store, &generations, &record, stamp).await;
            }
            WriteOp::Flush(reply) => {
                let _ = reply.send(());
            }
        }
    }
}

async fn write_record<T: Serialize>(
    store: &TierStore,
    generations: &Generations,
    record: &PersistedEntry<T>,
    stamp: Stamp,
) {
    if !generations.is_current(&record.key, stamp) {
        debug!(
            key = %record.key,
            tier = %store.tier,
            "Skipping write superseded by invalidation"
        );
        return;
    }
    let bytes = match serde_json::to_vec(record) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(key = %record.key, error = %err, "Failed to serialize cache entry");
            return;
        }
    };

    let storage_key = store.storage_key(&record.key);
    if let Err(err) = store.store.put(&storage_key, bytes).await {
        report_store_failure(store, "put", &err);
        return;
    }

    // An invalidation that ran while the put was in flight may have deleted
    // before the record landed.
    if !generations.is_current(&record.key, stamp) {
        debug!(
            key = %record.key,
            tier = %store.tier,
            "Retracting write raced by invalidation"
        );
        if let Err(err) = store.store.delete(&storage_key).await {
            report_store_failure(store, "delete", &err);
        }
        return;
    }
    debug!(key = %record.key, tier = %store.tier, "Propagated cache entry");
}

/// Delete `key` from every enabled lower tier concurrently.
///
/// Returns the tiers that actually held the key.
pub(crate) async fn delete_key(tiers: &LowerTiers, key: &CacheKey) -> Vec<Tier> {
    let deletes = tiers.iter().map(|store| async move {
        match store.store.delete(&store.storage_key(key)).await {
            Ok(true) => Some(store.tier),
            Ok(false) => None,
            Err(err) => {
                report_store_failure(store, "delete", &err);
                None
            }
        }
    });
    join_all(deletes).await.into_iter().flatten().collect()
}
