use std::collections::HashSet;
use std::convert::Infallible;
use std::num::NonZeroUsize;
use std::sync::{Arc, OnceLock};

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serial_test::serial;
use tiercache::cache::{CacheConfig, CacheKey, DurableStore, MemoryStore, MultiLevelCacheManager};
use tiercache::telemetry;

fn snapshotter() -> &'static Snapshotter {
    static SNAPSHOTTER: OnceLock<Snapshotter> = OnceLock::new();
    SNAPSHOTTER.get_or_init(|| {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        recorder
            .install()
            .expect("debug metrics recorder should install in this test process");
        telemetry::describe_metrics();
        snapshotter
    })
}

fn counter(name: &str, tier: Option<&str>) -> u64 {
    snapshotter()
        .snapshot()
        .into_vec()
        .into_iter()
        .filter(|(composite_key, _, _, _)| {
            let key = composite_key.key();
            key.name() == name
                && tier.is_none_or(|tier| {
                    key.labels()
                        .any(|label| label.key() == "tier" && label.value() == tier)
                })
        })
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(count) => count,
            _ => 0,
        })
        .sum()
}

fn key(name: &str) -> CacheKey {
    CacheKey::for_content("metrics", name, name, 1_u32)
}

fn store(name: &str) -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new(name, NonZeroUsize::new(16).expect("non-zero")))
}

#[tokio::test]
#[serial]
async fn cache_paths_emit_expected_metric_keys() {
    let snapshotter = snapshotter();
    let (l2, l3) = (store("l2"), store("l3"));
    let cache = MultiLevelCacheManager::new(
        CacheConfig {
            l1_max_entries: 1,
            auto_cleanup: false,
            ..Default::default()
        },
        l2.clone(),
        l3.clone(),
    );

    // L1 hit, eviction and miss
    cache.set(key("a"), 1_u32, None);
    cache.get(&key("a")).await;
    cache.set(key("b"), 2, None);
    cache.get(&key("missing")).await;

    // L2 and L3 hits
    cache.flush().await;
    cache.clear();
    cache.get(&key("a")).await;
    l2.delete(&format!("l2:{}", key("b").storage_id()))
        .await
        .expect("delete");
    cache.get(&key("b")).await;

    // Corrupt record and store failure
    l2.put(&format!("l2:{}", key("c").storage_id()), b"garbage".to_vec())
        .await
        .expect("put");
    cache.get(&key("c")).await;
    l3.set_failing(true);
    cache.get(&key("d")).await;
    l3.set_failing(false);

    // Computation latency
    cache
        .get_or_compute(&key("e"), |_| async { Ok::<_, Infallible>(5) })
        .await
        .expect("compute");

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "tiercache_l1_hit_total",
        "tiercache_l2_hit_total",
        "tiercache_l3_hit_total",
        "tiercache_miss_total",
        "tiercache_evict_total",
        "tiercache_store_failure_total",
        "tiercache_corrupt_entry_total",
        "tiercache_compute_ms",
        "tiercache_l1_entries",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }

    let undescribed: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .filter(|(_, _, description, _)| description.is_none())
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();
    assert!(undescribed.is_empty(), "metrics without a description: {undescribed:?}");
}

#[tokio::test]
#[serial]
async fn evictions_are_labelled_by_tier() {
    let cache = MultiLevelCacheManager::new(
        CacheConfig {
            auto_cleanup: false,
            ..Default::default()
        },
        store("l2"),
        store("l3"),
    );
    cache.set(key("x"), "value".to_string(), None);
    cache.flush().await;

    let before = ["l1", "l2", "l3"].map(|tier| counter("tiercache_evict_total", Some(tier)));
    cache.invalidate(&key("x")).await;
    let after = ["l1", "l2", "l3"].map(|tier| counter("tiercache_evict_total", Some(tier)));

    for (tier, (before, after)) in ["l1", "l2", "l3"].iter().zip(before.iter().zip(after)) {
        assert_eq!(after - before, 1, "tier {tier} should record one eviction");
    }
}

#[tokio::test]
#[serial]
async fn store_failures_are_counted_per_tier() {
    let (l2, l3) = (store("l2"), store("l3"));
    let cache: MultiLevelCacheManager<String> = MultiLevelCacheManager::new(
        CacheConfig {
            auto_cleanup: false,
            ..Default::default()
        },
        l2.clone(),
        l3.clone(),
    );
    l2.set_failing(true);

    let before = counter("tiercache_store_failure_total", Some("l2"));
    let untouched = counter("tiercache_store_failure_total", Some("l3"));
    cache.get(&key("y")).await;

    assert_eq!(counter("tiercache_store_failure_total", Some("l2")) - before, 1);
    assert_eq!(counter("tiercache_store_failure_total", Some("l3")), untouched);
}
