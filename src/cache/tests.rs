use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use super::*;
use crate::clock::{Clock, ManualClock};
use crate::store::{KeyValueStore, MemoryStore};

fn setup(kind: CacheKind) -> (CacheCoordinator, Arc<MemoryStore>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let coordinator = CacheCoordinator::new(store.clone(), clock.clone(), kind);
    (coordinator, store, clock)
}

async fn ok<T>(value: T) -> std::result::Result<T, String> {
    Ok(value)
}

#[tokio::test]
async fn test_second_call_is_served_from_cache() {
    let (cache, _store, _clock) = setup(CacheKind::Query);
    let descriptor = json!({"sql": "SELECT 1", "params": []});

    let first: Vec<i32> = cache
        .cached_compute(&descriptor, 60, || ok(vec![1, 2, 3]), &[])
        .await
        .unwrap();
    let second: Vec<i32> = cache
        .cached_compute(&descriptor, 60, || ok(vec![9]), &[])
        .await
        .unwrap();

    assert_eq!(first, vec![1, 2, 3]);
    assert_eq!(second, vec![1, 2, 3]);
    let stats = cache.stats();
    assert_eq!(stats.computations, 1);
    assert_eq!(stats.hits, 1);
}

#[tokio::test]
async fn test_entry_expires_with_clock() {
    let (cache, _store, clock) = setup(CacheKind::Metric);
    let descriptor = json!({"metric": "cpu", "window": "1h"});

    let _: i32 = cache
        .cached_compute(&descriptor, 10, || ok(1), &[])
        .await
        .unwrap();
    clock.advance(Duration::from_secs(10));
    let value: i32 = cache
        .cached_compute(&descriptor, 10, || ok(2), &[])
        .await
        .unwrap();

    assert_eq!(value, 2);
    assert_eq!(cache.stats().computations, 2);
}

#[tokio::test]
async fn test_logically_stale_entry_is_evicted() {
    let (cache, store, clock) = setup(CacheKind::Dashboard);
    let descriptor = json!({"dashboard": "ops"});
    let key = logical_key(CacheKind::Dashboard, &descriptor).unwrap();

    // Entry without a store TTL whose embedded window has passed.
    let entry = CacheEntry {
        logical_key: key.clone(),
        payload: json!("old"),
        cached_at_epoch_ms: clock.now_epoch_ms() - 61_000,
        ttl_seconds: 60,
    };
    store
        .set(&key, &serde_json::to_string(&entry).unwrap(), None)
        .await
        .unwrap();

    let value: String = cache
        .cached_compute(&descriptor, 60, || ok("new".to_string()), &[])
        .await
        .unwrap();
    assert_eq!(value, "new");
    assert_eq!(cache.stats().stale_evictions, 1);
}

#[tokio::test]
async fn test_invalidate_by_tag_counts_removed_entries() {
    let (cache, store, _clock) = setup(CacheKind::Query);

    let _: i32 = cache
        .cached_compute(&json!({"q": 1}), 60, || ok(1), &["users"])
        .await
        .unwrap();
    let _: i32 = cache
        .cached_compute(&json!({"q": 2}), 60, || ok(2), &["users", "orders"])
        .await
        .unwrap();
    let _: i32 = cache
        .cached_compute(&json!({"q": 3}), 60, || ok(3), &["orders"])
        .await
        .unwrap();

    assert_eq!(cache.invalidate_by_tag("users").await.unwrap(), 2);
    assert!(!store.exists("query:table:users").await.unwrap());

    let key3 = logical_key(CacheKind::Query, &json!({"q": 3})).unwrap();
    assert!(store.exists(&key3).await.unwrap());

    // Stale index members no longer count.
    assert_eq!(cache.invalidate_by_tag("orders").await.unwrap(), 1);
    assert_eq!(cache.invalidate_by_tag("missing").await.unwrap(), 0);
}

#[tokio::test]
async fn test_invalidate_single_entry() {
    let (cache, _store, _clock) = setup(CacheKind::Aggregation);
    let descriptor = json!({"collection": "orders"});
    let _: i32 = cache
        .cached_compute(&descriptor, 60, || ok(1), &[])
        .await
        .unwrap();

    assert!(cache.invalidate(&descriptor).await.unwrap());
    assert!(!cache.invalidate(&descriptor).await.unwrap());
}

#[tokio::test]
async fn test_upstream_failure_caches_nothing() {
    let (cache, store, _clock) = setup(CacheKind::Query);
    let result: Result<i32> = cache
        .cached_compute(
            &json!({"q": 1}),
            60,
            || async { Err::<i32, _>("db down") },
            &["users"],
        )
        .await;

    assert!(matches!(result, Err(CacheError::UpstreamCompute(msg)) if msg == "db down"));
    assert_eq!(store.key_count().await, 0);
}

#[tokio::test]
async fn test_corrupted_entry_is_an_error() {
    let (cache, store, _clock) = setup(CacheKind::Query);
    let descriptor = json!({"q": 1});
    let key = logical_key(CacheKind::Query, &descriptor).unwrap();
    store.set(&key, "not json", None).await.unwrap();

    let result: Result<i32> = cache
        .cached_compute(&descriptor, 60, || ok(1), &[])
        .await;
    assert!(matches!(result, Err(CacheError::Serialization(_))));
}

#[tokio::test]
async fn test_zero_ttl_is_not_cached() {
    let (cache, store, _clock) = setup(CacheKind::Query);
    let value: i32 = cache
        .cached_compute(&json!({"q": 1}), 0, || ok(7), &["users"])
        .await
        .unwrap();
    assert_eq!(value, 7);
    assert_eq!(store.key_count().await, 0);
}

#[tokio::test]
async fn test_concurrent_misses_share_one_computation() {
    let (cache, _store, _clock) = setup(CacheKind::Query);
    let cache = Arc::new(cache);
    let calls = Arc::new(AtomicUsize::new(0));

    let tasks = (0..8).map(|_| {
        let cache = cache.clone();
        let calls = calls.clone();
        tokio::spawn(async move {
            cache
                .cached_compute(
                    &json!({"q": "slow"}),
                    60,
                    || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, String>(42)
                    },
                    &[],
                )
                .await
        })
    });

    for result in futures::future::join_all(tasks).await {
        let value: i32 = result.unwrap().unwrap();
        assert_eq!(value, 42);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_without_single_flight_each_miss_computes() {
    let (cache, _store, _clock) = setup(CacheKind::Query);
    let cache = Arc::new(cache.with_single_flight(None));
    let calls = Arc::new(AtomicUsize::new(0));

    let tasks = (0..4).map(|_| {
        let cache = cache.clone();
        let calls = calls.clone();
        tokio::spawn(async move {
            cache
                .cached_compute(
                    &json!({"q": "slow"}),
                    60,
                    || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, String>(42)
                    },
                    &[],
                )
                .await
        })
    });

    for result in futures::future::join_all(tasks).await {
        let _: i32 = result.unwrap().unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_cancelled_callers_release_their_gates() {
    let (cache, _store, _clock) = setup(CacheKind::Aggregation);
    let flights = SingleFlight::new();
    let cache = cache.with_single_flight(Some(flights.clone()));

    for n in 0..50 {
        let key = json!({"bucket": n});
        let call = cache.cached_compute(
            &key,
            60,
            move || async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, String>(n)
            },
            &[],
        );
        let timed_out = tokio::time::timeout(Duration::from_millis(1), call).await;
        assert!(timed_out.is_err());
    }
    assert_eq!(flights.in_flight(), 0);

    // A caller abandoned while queued behind another releases its share too.
    let cache = Arc::new(cache);
    let holder = {
        let cache = cache.clone();
        tokio::spawn(async move {
            cache
                .cached_compute(
                    &json!({"bucket": "shared"}),
                    60,
                    || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, String>(1)
                    },
                    &[],
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    let shared_key = json!({"bucket": "shared"});
    let waiter = cache.cached_compute(&shared_key, 60, || ok(2), &[]);
    assert!(tokio::time::timeout(Duration::from_millis(1), waiter)
        .await
        .is_err());
    assert_eq!(flights.in_flight(), 1);

    let value: i32 = holder.await.unwrap().unwrap();
    assert_eq!(value, 1);
    assert_eq!(flights.in_flight(), 0);
}
