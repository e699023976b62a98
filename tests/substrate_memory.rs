//! End-to-end behaviour on the in-process backends.
//!
//! Run with: cargo test --test substrate_memory --features test-utils

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use cachebus::bus::{LegOutcome, Message};
use cachebus::cache::CacheError;
use cachebus::events::{ConsumeFilter, Event};
use cachebus::store::KeyValueStore;
use cachebus::test_utils::{eventually, fast_consumer_options, MemoryHarness, RecordingHandler};
use cachebus::{EventType, NewEvent, Priority, Transport};

#[tokio::test]
async fn test_query_cache_read_through_and_table_invalidation() {
    let harness = MemoryHarness::new();
    let cache = harness.substrate.query_cache();
    let computations = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let counter = computations.clone();
        let rows: Vec<Value> = cache
            .cached_query(
                "SELECT * FROM orders WHERE id = $1",
                &[json!(7)],
                60,
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, CacheError>(vec![json!({"id": 7})])
                },
                &["orders"],
            )
            .await
            .unwrap();
        assert_eq!(rows, vec![json!({"id": 7})]);
    }
    assert_eq!(computations.load(Ordering::SeqCst), 1);

    assert_eq!(cache.invalidate_table("orders").await.unwrap(), 1);

    harness.clock.advance(Duration::from_secs(1));
    let counter = computations.clone();
    let _: Vec<Value> = cache
        .cached_query(
            "SELECT * FROM orders WHERE id = $1",
            &[json!(7)],
            60,
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CacheError>(vec![])
            },
            &["orders"],
        )
        .await
        .unwrap();
    assert_eq!(computations.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_event_log_consume_and_replay() {
    let harness = MemoryHarness::new();
    let log = harness.substrate.event_log();

    for n in 0..3 {
        log.publish(
            NewEvent::new(EventType::EntityUpdated, json!({"n": n})).for_entity("order", "42"),
        )
        .await
        .unwrap();
        harness.clock.advance(Duration::from_millis(5));
    }

    let handler = RecordingHandler::<Event>::failing_first(1);
    let consumer = log.consume(
        handler.clone(),
        ConsumeFilter::all().entity("order", "42"),
        fast_consumer_options("projector"),
    );
    assert!(eventually(|| handler.received().len() == 3).await);
    consumer.shutdown().await;

    // One failed attempt, then every event exactly once.
    assert_eq!(handler.calls(), 4);
    let payloads: Vec<Value> = handler.received().iter().map(|e| e.payload.clone()).collect();
    assert_eq!(payloads.len(), 3);
    assert!(payloads.contains(&json!({"n": 0})));

    let replayed = log.replay("order", "42", 0).await.unwrap();
    assert_eq!(replayed.len(), 3);
    assert_eq!(replayed, log.replay("order", "42", 0).await.unwrap());
}

#[tokio::test]
async fn test_broker_delivers_on_both_legs() {
    let harness = MemoryHarness::new();
    let broker = harness.substrate.broker();
    let handler = RecordingHandler::<Message>::new();

    let consumer = broker.consume_messages(
        "orders.created",
        handler.clone(),
        Transport::Both,
        fast_consumer_options("billing"),
    );
    let receipt = broker
        .publish_message(json!({"id": 1}), "orders.created", Priority::High, Transport::Both)
        .await
        .unwrap();
    assert!(receipt.stream.is_published());
    assert!(receipt.queue.is_published());

    // The same message arrives once per leg.
    assert!(eventually(|| handler.received().len() == 2).await);
    consumer.shutdown().await;

    let received = handler.received();
    assert!(received.iter().all(|m| m.message_id == receipt.message.message_id));
    assert_eq!(received[0].source, "cachebus");
    assert_eq!(harness.queue.counters("orders.created").await.acked, 1);
}

#[tokio::test]
async fn test_degraded_broker_keeps_stream_leg() {
    let harness = MemoryHarness::new();
    harness.queue.set_connected(false);
    assert!(harness.substrate.is_degraded());

    let receipt = harness
        .substrate
        .broker()
        .publish_message(json!({}), "alerts", Priority::Critical, Transport::Both)
        .await
        .unwrap();
    assert_eq!(receipt.queue, LegOutcome::Degraded);
    assert_eq!(harness.store.xlen("messages:alerts").await.unwrap(), 1);
}

#[tokio::test]
async fn test_dispatcher_routes_by_key() {
    let harness = MemoryHarness::new();
    let broker = harness.substrate.broker();
    let dispatcher = harness.substrate.dispatcher();

    let created = RecordingHandler::<Message>::new();
    let cancelled = RecordingHandler::<Message>::new();
    dispatcher.register("orders.created", created.clone()).await;
    dispatcher.register("orders.cancelled", cancelled.clone()).await;

    let consumers = dispatcher
        .start(&broker, Transport::Stream, fast_consumer_options("router"))
        .await;
    broker
        .publish_message(json!({"id": 1}), "orders.created", Priority::Normal, Transport::Stream)
        .await
        .unwrap();
    broker
        .publish_message(json!({"id": 2}), "orders.cancelled", Priority::Normal, Transport::Stream)
        .await
        .unwrap();

    assert!(eventually(|| created.received().len() == 1 && cancelled.received().len() == 1).await);
    consumers.shutdown().await;
    assert_eq!(created.received()[0].payload, json!({"id": 1}));
}

#[tokio::test]
async fn test_data_service_stats_through_substrate() {
    let harness = MemoryHarness::new();
    let data = harness.substrate.data();
    data.sorted_set_add("leaders", "m1", 2.0).await.unwrap();
    data.sorted_set_add("leaders", "m2", 1.0).await.unwrap();
    data.sorted_set_add("leaders", "m3", 2.0).await.unwrap();

    let order: Vec<(String, f64)> = data.sorted_set_range("leaders", 0, -1).await.unwrap();
    let members: Vec<&str> = order.iter().map(|(m, _)| m.as_str()).collect();
    assert_eq!(members, vec!["m2", "m1", "m3"]);

    let stats = data.get_stats().await.unwrap();
    assert_eq!(stats.total_keys(), 1);
    assert!(harness.store.exists("data:zset:leaders").await.unwrap());
}
