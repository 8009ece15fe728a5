//! Periodic removal of expired L1 entries.

use std::sync::{Arc, Weak};
use std::time::Duration;

use metrics::gauge;
use tokio::task::JoinHandle;
use tracing::debug;

use super::stats::{CacheStatistics, METRIC_L1_ENTRIES};
use super::tier::{L1Tier, Tier};

/// Remove every expired L1 entry, counting each removal as an eviction.
pub(crate) fn sweep_expired<T: Clone>(l1: &L1Tier<T>, stats: &CacheStatistics) -> usize {
    let removed = l1.sweep_expired();
    for _ in &removed {
        stats.record_eviction(Tier::L1);
    }
    gauge!(METRIC_L1_ENTRIES).set(l1.len() as f64);
    if !removed.is_empty() {
        debug!(removed = removed.len(), "Swept expired cache entries");
    }
    removed.len()
}

/// Background sweep task. Stops on [`Sweeper::stop`], on drop, or once the
/// tier it sweeps has been dropped.
pub(crate) struct Sweeper {
    handle: JoinHandle<()>,
}

impl Sweeper {
    pub fn spawn<T>(l1: Weak<L1Tier<T>>, stats: Arc<CacheStatistics>, every: Duration) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await; // Skip the first immediate tick
            loop {
                interval.tick().await;
                let Some(l1) = l1.upgrade() else {
                    break;
                };
                sweep_expired(&l1, &stats);
            }
        });
        Self { handle }
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;
    use crate::cache::entry::CacheEntry;
    use crate::cache::keys::{CacheKey, Fingerprint};

    fn key(n: u64) -> CacheKey {
        CacheKey::new("artifact", "src", Fingerprint::from_raw(n), 1_u32)
    }

    fn short_lived(n: u64) -> CacheEntry<u64> {
        CacheEntry::create(key(n), n, Some(Duration::from_millis(1)))
    }

    #[test]
    fn sweep_counts_evictions() {
        let l1 = L1Tier::new(NonZeroUsize::new(8).expect("non-zero"));
        let stats = CacheStatistics::new();
        l1.insert(short_lived(1));
        l1.insert(short_lived(2));
        l1.insert(CacheEntry::create(key(3), 3, None));
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(sweep_expired(&l1, &stats), 2);
        assert_eq!(stats.snapshot().evictions, 2);
        assert_eq!(l1.len(), 1);
    }

    #[tokio::test]
    async fn background_sweep_runs_on_interval() {
        let l1 = Arc::new(L1Tier::new(NonZeroUsize::new(8).expect("non-zero")));
        let stats = Arc::new(CacheStatistics::new());
        l1.insert(short_lived(1));

        let sweeper = Sweeper::spawn(
            Arc::downgrade(&l1),
            Arc::clone(&stats),
            Duration::from_millis(10),
        );
        tokio::time::sleep(Duration::from_millis(80)).await;
        sweeper.stop();

        assert_eq!(l1.len(), 0);
        assert_eq!(stats.snapshot().evictions, 1);
    }
}
