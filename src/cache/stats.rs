//! Hit/miss/eviction accounting for a cache manager.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use metrics::counter;

use super::lock::mutex_lock;
use super::tier::Tier;

const SOURCE: &str = "cache::stats";

pub(crate) const METRIC_L1_HIT: &str = "tiercache_l1_hit_total";
pub(crate) const METRIC_L2_HIT: &str = "tiercache_l2_hit_total";
pub(crate) const METRIC_L3_HIT: &str = "tiercache_l3_hit_total";
pub(crate) const METRIC_MISS: &str = "tiercache_miss_total";
pub(crate) const METRIC_EVICT: &str = "tiercache_evict_total";
pub(crate) const METRIC_STORE_FAILURE: &str = "tiercache_store_failure_total";
pub(crate) const METRIC_CORRUPT_ENTRY: &str = "tiercache_corrupt_entry_total";
pub(crate) const METRIC_COMPUTE_MS: &str = "tiercache_compute_ms";
pub(crate) const METRIC_L1_ENTRIES: &str = "tiercache_l1_entries";

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub l3_hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub total_accesses: u64,
    pub total_latency: Duration,
}

impl StatsSnapshot {
    pub fn hits(&self) -> u64 {
        self.l1_hits + self.l2_hits + self.l3_hits
    }

    /// Fraction of accesses served by any tier (0.0 to 1.0).
    pub fn hit_ratio(&self) -> f64 {
        if self.total_accesses == 0 {
            0.0
        } else {
            self.hits() as f64 / self.total_accesses as f64
        }
    }

    pub fn average_access_time(&self) -> Duration {
        if self.total_accesses == 0 {
            Duration::ZERO
        } else {
            let nanos = self.total_latency.as_nanos() / u128::from(self.total_accesses);
            Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
        }
    }

    /// One-line diagnostic summary.
    pub fn summary(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "L1: {}, L2: {}, L3: {}, Misses: {}, Evictions: {}, Hit Ratio: {:.2}%, Avg Access: {:.2}ms",
            self.l1_hits,
            self.l2_hits,
            self.l3_hits,
            self.misses,
            self.evictions,
            self.hit_ratio() * 100.0,
            self.average_access_time().as_secs_f64() * 1000.0,
        )
    }
}

/// Per-manager statistics accumulator.
///
/// All counters sit behind one small mutex owned by this struct alone, so
/// each `record_*` call is a single atomic update relative to readers and
/// `reset` never exposes a half-zeroed state. The lock is never held across
/// an await or any I/O.
#[derive(Debug, Default)]
pub struct CacheStatistics {
    counters: Mutex<StatsSnapshot>,
}

impl CacheStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_l1_hit(&self, latency: Duration) {
        self.record_access(latency, |c| c.l1_hits += 1);
        counter!(METRIC_L1_HIT).increment(1);
    }

    pub fn record_l2_hit(&self, latency: Duration) {
        self.record_access(latency, |c| c.l2_hits += 1);
        counter!(METRIC_L2_HIT).increment(1);
    }

    pub fn record_l3_hit(&self, latency: Duration) {
        self.record_access(latency, |c| c.l3_hits += 1);
        counter!(METRIC_L3_HIT).increment(1);
    }

    pub fn record_miss(&self, latency: Duration) {
        self.record_access(latency, |c| c.misses += 1);
        counter!(METRIC_MISS).increment(1);
    }

    /// Count one removal from `tier`. Does not touch `total_accesses`.
    pub fn record_eviction(&self, tier: Tier) {
        mutex_lock(&self.counters, SOURCE, "record_eviction").evictions += 1;
        counter!(METRIC_EVICT, "tier" => tier.as_str()).increment(1);
    }

    fn record_access(&self, latency: Duration, bump: impl FnOnce(&mut StatsSnapshot)) {
        let mut counters = mutex_lock(&self.counters, SOURCE, "record_access");
        bump(&mut counters);
        counters.total_accesses += 1;
        counters.total_latency += latency;
    }

    pub fn reset(&self) {
        *mutex_lock(&self.counters, SOURCE, "reset") = StatsSnapshot::default();
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        *mutex_lock(&self.counters, SOURCE, "snapshot")
    }

    pub fn hit_ratio(&self) -> f64 {
        self.snapshot().hit_ratio()
    }

    pub fn average_access_time(&self) -> Duration {
        self.snapshot().average_access_time()
    }

    pub fn summary(&self) -> String {
        self.snapshot().summary()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn empty_statistics_report_zero_ratio_and_latency() {
        let stats = CacheStatistics::new();
        assert_eq!(stats.hit_ratio(), 0.0);
        assert_eq!(stats.average_access_time(), Duration::ZERO);
    }

    #[test]
    fn hit_ratio_matches_hits_over_accesses() {
        for n in 1..=20_u64 {
            let stats = CacheStatistics::new();
            let hits = n / 3;
            for _ in 0..hits {
                stats.record_l1_hit(Duration::ZERO);
            }
            for _ in hits..n {
                stats.record_miss(Duration::ZERO);
            }

            let snapshot = stats.snapshot();
            assert_eq!(snapshot.total_accesses, n);
            let expected = hits as f64 / n as f64;
            assert!((snapshot.hit_ratio() - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn evictions_do_not_count_as_accesses() {
        let stats = CacheStatistics::new();
        stats.record_l2_hit(Duration::ZERO);
        stats.record_eviction(Tier::L1);
        stats.record_eviction(Tier::L3);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.evictions, 2);
        assert_eq!(snapshot.total_accesses, 1);
        assert_eq!(snapshot.hit_ratio(), 1.0);
    }

    #[test]
    fn average_access_time_divides_latency_sum() {
        let stats = CacheStatistics::new();
        stats.record_l1_hit(Duration::from_millis(1));
        stats.record_l3_hit(Duration::from_millis(5));
        stats.record_miss(Duration::from_millis(9));

        assert_eq!(stats.average_access_time(), Duration::from_millis(5));
    }

    #[test]
    fn reset_zeroes_everything() {
        let stats = CacheStatistics::new();
        stats.record_l1_hit(Duration::from_millis(2));
        stats.record_eviction(Tier::L1);
        stats.reset();

        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn summary_has_stable_layout() {
        let stats = CacheStatistics::new();
        stats.record_l1_hit(Duration::from_micros(500));
        stats.record_l2_hit(Duration::from_micros(1500));
        stats.record_l3_hit(Duration::ZERO);
        stats.record_miss(Duration::ZERO);

        assert_eq!(
            stats.summary(),
            "L1: 1, L2: 1, L3: 1, Misses: 1, Evictions: 0, Hit Ratio: 75.00%, Avg Access: 0.50ms"
        );
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let stats = Arc::new(CacheStatistics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        stats.record_l1_hit(Duration::from_nanos(1));
                        stats.record_miss(Duration::from_nanos(1));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker thread should finish");
        }

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_accesses, 16_000);
        assert_eq!(snapshot.l1_hits, 8_000);
        assert_eq!(snapshot.misses, 8_000);
        assert_eq!(snapshot.total_latency, Duration::from_nanos(16_000));
    }
}
