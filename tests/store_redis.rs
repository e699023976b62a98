//! Redis store integration tests.
//!
//! Run with: cargo test --test store_redis --features redis -- --ignored --nocapture
//!
//! Requires: REDIS_URI env var or Redis on localhost:6379
//!
//! Note: Tests use unique key prefixes to avoid data conflicts between runs.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use cachebus::cache::{CacheCoordinator, CacheError, CacheKind};
use cachebus::clock::system_clock;
use cachebus::consumer::{ensure_group, GroupStart};
use cachebus::store::{KeyTtl, KeyValueStore, ReadCursor, RedisStore, CLAIM_START};

fn redis_uri() -> String {
    std::env::var("REDIS_URI").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

fn test_prefix() -> String {
    format!(
        "test_{}",
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    )
}

async fn connect() -> Arc<RedisStore> {
    Arc::new(
        RedisStore::connect(&redis_uri())
            .await
            .expect("Failed to connect to Redis"),
    )
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_keys_and_ttl() {
    let store = connect().await;
    let key = format!("{}:plain", test_prefix());

    store.set(&key, "v", Some(Duration::from_secs(30))).await.unwrap();
    assert_eq!(store.get(&key).await.unwrap(), Some("v".to_string()));
    assert!(matches!(store.ttl(&key).await.unwrap(), KeyTtl::Remaining(s) if s <= 30));

    store.set(&key, "v", None).await.unwrap();
    assert_eq!(store.ttl(&key).await.unwrap(), KeyTtl::Persistent);

    assert_eq!(store.delete(&[key.clone()]).await.unwrap(), 1);
    assert_eq!(store.ttl(&key).await.unwrap(), KeyTtl::Missing);
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_sorted_set_order() {
    let store = connect().await;
    let key = format!("{}:zset", test_prefix());

    store.zadd(&key, "m1", 5.0).await.unwrap();
    store.zadd(&key, "m2", 1.0).await.unwrap();
    store.zadd(&key, "m3", 5.0).await.unwrap();

    let members: Vec<String> = store
        .zrange_withscores(&key, 0, -1)
        .await
        .unwrap()
        .into_iter()
        .map(|(m, _)| m)
        .collect();
    assert_eq!(members, vec!["m2", "m1", "m3"]);
    store.delete(&[key]).await.unwrap();
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_consumer_group_pending_redelivery() {
    let store = connect().await;
    let stream = format!("{}:stream", test_prefix());

    store
        .xadd(&stream, &[("data".to_string(), "x".to_string())])
        .await
        .unwrap();
    ensure_group(store.as_ref(), &stream, "g", GroupStart::Beginning)
        .await
        .unwrap();
    ensure_group(store.as_ref(), &stream, "g", GroupStart::Beginning)
        .await
        .unwrap();

    let first = store
        .xreadgroup(&stream, "g", "c1", ReadCursor::New, 10, None)
        .await
        .unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(store.xpending_count(&stream, "g").await.unwrap(), 1);

    let pending = store
        .xreadgroup(&stream, "g", "c1", ReadCursor::pending(), 10, None)
        .await
        .unwrap();
    assert_eq!(pending[0].id, first[0].id);
    assert!(store
        .xreadgroup(&stream, "g", "c1", ReadCursor::pending_after(first[0].id.clone()), 10, None)
        .await
        .unwrap()
        .is_empty());

    // A consumer from a later process takes over the idle entry.
    let claim = store
        .xautoclaim(&stream, "g", "c2", Duration::ZERO, CLAIM_START, 10)
        .await
        .unwrap();
    assert_eq!(claim.entries.len(), 1);
    assert_eq!(claim.entries[0].id, first[0].id);
    assert!(store
        .xreadgroup(&stream, "g", "c1", ReadCursor::pending(), 10, None)
        .await
        .unwrap()
        .is_empty());

    store
        .xack(&stream, "g", &[first[0].id.clone()])
        .await
        .unwrap();
    assert_eq!(store.xpending_count(&stream, "g").await.unwrap(), 0);
    store.delete(&[stream]).await.unwrap();
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_cache_tag_invalidation() {
    let store = connect().await;
    let tag = format!("{}_orders", test_prefix());
    let cache = CacheCoordinator::new(store.clone(), system_clock(), CacheKind::Query);

    for id in [1, 2] {
        let value: serde_json::Value = cache
            .cached_compute(
                &json!({"id": id, "tag": tag}),
                60,
                || async move { Ok::<_, CacheError>(json!({"id": id})) },
                &[tag.as_str()],
            )
            .await
            .unwrap();
        assert_eq!(value, json!({"id": id}));
    }

    assert_eq!(cache.invalidate_by_tag(&tag).await.unwrap(), 2);
    assert_eq!(cache.invalidate_by_tag(&tag).await.unwrap(), 0);
}
