//! At most one computation per key, shared by every concurrent caller.

use std::convert::Infallible;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use thiserror::Error;
use tiercache::cache::{CacheConfig, CacheKey, MemoryStore, MultiLevelCacheManager, Producer};
use tokio::sync::Barrier;

#[derive(Debug, Error)]
#[error("dependency resolver failed for {0}")]
struct ResolveError(String);

fn key(name: &str) -> CacheKey {
    CacheKey::for_content("resolution", name, name, 1_u32)
}

fn cache() -> Arc<MultiLevelCacheManager<u64>> {
    Arc::new(MultiLevelCacheManager::in_memory(CacheConfig {
        auto_cleanup: false,
        ..Default::default()
    }))
}

fn slow_cache(latency: Duration) -> (Arc<MultiLevelCacheManager<u64>>, Arc<MemoryStore>) {
    let slow = |name: &str| {
        Arc::new(
            MemoryStore::new(name, NonZeroUsize::new(64).expect("non-zero"))
                .with_latency(latency, Duration::ZERO),
        )
    };
    let l2 = slow("l2");
    let cache = MultiLevelCacheManager::new(
        CacheConfig {
            auto_cleanup: false,
            ..Default::default()
        },
        l2.clone(),
        slow("l3"),
    );
    (Arc::new(cache), l2)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_share_one_computation() {
    let cache = cache();
    let calls = Arc::new(AtomicUsize::new(0));

    let tasks = (0..16).map(|_| {
        let cache = Arc::clone(&cache);
        let calls = Arc::clone(&calls);
        tokio::spawn(async move {
            cache
                .get_or_compute(&key("graph"), |_| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, Infallible>(42)
                })
                .await
        })
    });

    for result in join_all(tasks).await {
        let value = result.expect("task should not panic").expect("compute succeeds");
        assert_eq!(value, 42);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.get(&key("graph")).await, Some(42));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failure_reaches_every_waiter_and_is_not_cached() {
    let cache = cache();
    let calls = Arc::new(AtomicUsize::new(0));

    let tasks = (0..8).map(|_| {
        let cache = Arc::clone(&cache);
        let calls = Arc::clone(&calls);
        tokio::spawn(async move {
            cache
                .get_or_compute(&key("broken"), |key| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Err::<u64, _>(ResolveError(key.source_identifier().to_string()))
                })
                .await
        })
    });

    let errors: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|result| result.expect("task should not panic").expect_err("compute fails"))
        .collect();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let first = errors[0].compute_error().expect("compute failure");
    for error in &errors {
        assert_eq!(error.key(), &key("broken"));
        let failure = error.compute_error().expect("compute failure");
        assert!(failure.same_failure(first));
        assert_eq!(
            failure.downcast_ref::<ResolveError>().map(|e| e.0.as_str()),
            Some("broken")
        );
    }

    assert_eq!(cache.get(&key("broken")).await, None);
    let value = cache
        .get_or_compute(&key("broken"), |_| async { Ok::<_, Infallible>(7) })
        .await
        .expect("retry succeeds");
    assert_eq!(value, 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_keys_compute_independently() {
    let cache = cache();
    // Both producers must be running at once for either to finish.
    let barrier = Arc::new(Barrier::new(2));

    let tasks = ["left", "right"].map(|name| {
        let cache = Arc::clone(&cache);
        let barrier = Arc::clone(&barrier);
        tokio::spawn(async move {
            cache
                .get_or_compute(&key(name), |_| async move {
                    barrier.wait().await;
                    Ok::<_, Infallible>(name.len() as u64)
                })
                .await
        })
    });

    let results = tokio::time::timeout(Duration::from_secs(5), join_all(tasks))
        .await
        .expect("computations for different keys must not serialize");
    for result in results {
        result.expect("task should not panic").expect("compute succeeds");
    }
}

#[tokio::test]
async fn abandoned_leader_hands_over_to_a_waiter() {
    let cache = cache();

    let leader = tokio::spawn({
        let cache = Arc::clone(&cache);
        async move {
            cache
                .get_or_compute(&key("slow"), |_| {
                    std::future::pending::<Result<u64, Infallible>>()
                })
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let follower = tokio::spawn({
        let cache = Arc::clone(&cache);
        async move {
            cache
                .get_or_compute(&key("slow"), |_| async { Ok::<_, Infallible>(99) })
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    leader.abort();

    let value = follower
        .await
        .expect("follower should not panic")
        .expect("follower computes after the leader is gone");
    assert_eq!(value, 99);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn computation_overtaken_by_invalidation_is_not_cached() {
    let (cache, l2) = slow_cache(Duration::from_millis(20));

    let computing = tokio::spawn({
        let cache = Arc::clone(&cache);
        async move {
            cache
                .get_or_compute(&key("plan"), |_| async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, Infallible>(1)
                })
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(60)).await;
    cache.invalidate(&key("plan")).await;

    let value = computing
        .await
        .expect("task should not panic")
        .expect("compute succeeds");
    assert_eq!(value, 1);
    cache.flush().await;

    assert_eq!(cache.l1_len(), 0);
    assert!(l2.is_empty());
    assert_eq!(cache.get(&key("plan")).await, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pending_computation_does_not_block_other_keys() {
    let (cache, _l2) = slow_cache(Duration::from_millis(5));

    let stuck = tokio::spawn({
        let cache = Arc::clone(&cache);
        async move {
            cache
                .get_or_compute(&key("stuck"), |_| {
                    std::future::pending::<Result<u64, Infallible>>()
                })
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;

    let other = tokio::time::timeout(Duration::from_secs(2), async {
        cache.set(key("other"), 3, None);
        let hit = cache.get(&key("other")).await;
        let computed = cache
            .get_or_compute(&key("fresh"), |_| async { Ok::<_, Infallible>(4) })
            .await;
        cache.invalidate(&key("other")).await;
        (hit, computed)
    })
    .await
    .expect("operations on other keys must not wait for a pending computation");

    assert_eq!(other.0, Some(3));
    assert_eq!(other.1.expect("compute succeeds"), 4);
    stuck.abort();
}

struct LengthProducer {
    calls: AtomicUsize,
}

#[async_trait]
impl Producer<u64> for LengthProducer {
    type Error = Infallible;

    async fn produce(&self, key: &CacheKey) -> Result<u64, Self::Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(key.source_identifier().len() as u64)
    }
}

#[tokio::test]
async fn producer_is_only_consulted_on_a_miss() {
    let cache = cache();
    let producer = LengthProducer {
        calls: AtomicUsize::new(0),
    };

    let first = cache
        .get_or_produce(&key("Cargo.lock"), &producer)
        .await
        .expect("produce");
    let second = cache
        .get_or_produce(&key("Cargo.lock"), &producer)
        .await
        .expect("cached");

    assert_eq!(first, 10);
    assert_eq!(second, 10);
    assert_eq!(producer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().l1_hits, 1);
}
