//! AMQP/RabbitMQ queue transport integration tests.
//!
//! Run with: cargo test --test bus_amqp --features amqp -- --ignored --nocapture
//!
//! Requires: AMQP_URL env var or RabbitMQ on localhost:5672
//!
//! Note: Tests use a unique service prefix so queues never collide between runs.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;

use cachebus::bus::{HybridBroker, LegOutcome, Priority, Transport};
use cachebus::clock::system_clock;
use cachebus::queue::{
    AmqpQueueConfig, AmqpTransport, DeliveryStream, QueueDelivery, QueueError, QueueTransport,
};
use cachebus::store::MemoryStore;

fn amqp_url() -> String {
    std::env::var("AMQP_URL").unwrap_or_else(|_| "amqp://localhost:5672".to_string())
}

fn test_prefix() -> String {
    format!(
        "test_{}",
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    )
}

async fn connect(prefix: &str) -> AmqpTransport {
    let config = AmqpQueueConfig {
        url: amqp_url(),
        ..Default::default()
    };
    AmqpTransport::connect(&config, prefix)
        .await
        .expect("Failed to connect to RabbitMQ")
}

async fn next(stream: &mut DeliveryStream) -> QueueDelivery {
    tokio::time::timeout(Duration::from_secs(10), stream.next())
        .await
        .expect("timed out waiting for delivery")
        .expect("stream ended")
        .expect("delivery error")
}

#[tokio::test]
#[ignore = "requires running RabbitMQ instance"]
async fn test_amqp_priority_order() {
    let prefix = test_prefix();
    let transport = connect(&prefix).await;

    // Declare the queue before publishing so early messages are routed.
    drop(transport.subscribe("jobs").await.unwrap());

    transport.publish("jobs", b"low", Priority::Low.amqp_priority()).await.unwrap();
    transport.publish("jobs", b"critical", Priority::Critical.amqp_priority()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut stream = transport.subscribe("jobs").await.unwrap();
    let first = next(&mut stream).await;
    assert_eq!(first.payload, b"critical");
    first.ack().await.unwrap();
    let second = next(&mut stream).await;
    assert_eq!(second.payload, b"low");
    second.ack().await.unwrap();

    transport.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires running RabbitMQ instance"]
async fn test_amqp_conflicting_queue_fails_without_retry() {
    use lapin::options::QueueDeclareOptions;
    use lapin::types::FieldTable;
    use lapin::{Connection, ConnectionProperties};

    let prefix = test_prefix();
    // Someone else declared the queue without a priority limit.
    let conn = Connection::connect(&amqp_url(), ConnectionProperties::default())
        .await
        .unwrap();
    let channel = conn.create_channel().await.unwrap();
    channel
        .queue_declare(
            &format!("{}_conflict", prefix),
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .unwrap();

    let transport = connect(&prefix).await;
    let started = std::time::Instant::now();
    let result = transport.publish("conflict", b"m", 5).await;

    assert!(matches!(result, Err(QueueError::Subscribe(_))));
    // The first publish backoff step alone is 100ms.
    assert!(started.elapsed() < Duration::from_millis(100));

    channel
        .queue_delete(&format!("{}_conflict", prefix), Default::default())
        .await
        .unwrap();
    transport.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires running RabbitMQ instance"]
async fn test_amqp_nack_requeue_redelivers() {
    let prefix = test_prefix();
    let transport = connect(&prefix).await;
    let mut stream = transport.subscribe("retry").await.unwrap();

    transport.publish("retry", b"m", 5).await.unwrap();
    let first = next(&mut stream).await;
    assert!(!first.redelivered);
    first.nack(true).await.unwrap();

    let second = next(&mut stream).await;
    assert!(second.redelivered);
    assert_eq!(second.payload, b"m");
    second.ack().await.unwrap();

    transport.close().await.unwrap();
    assert!(!transport.is_connected());
}

#[tokio::test]
#[ignore = "requires running RabbitMQ instance"]
async fn test_broker_publishes_to_amqp_leg() {
    let prefix = test_prefix();
    let transport: Arc<dyn QueueTransport> = Arc::new(connect(&prefix).await);
    let mut stream = transport.subscribe("orders.created").await.unwrap();

    let broker = HybridBroker::new(
        Arc::new(MemoryStore::new()),
        Some(transport.clone()),
        system_clock(),
        "messages",
        prefix.clone(),
    );
    let receipt = broker
        .publish_message(json!({"id": 1}), "orders.created", Priority::High, Transport::Both)
        .await
        .unwrap();
    assert_eq!(receipt.queue, LegOutcome::Published(None));

    let delivery = next(&mut stream).await;
    let message: cachebus::Message = serde_json::from_slice(&delivery.payload).unwrap();
    assert_eq!(message.message_id, receipt.message.message_id);
    assert_eq!(message.source, prefix);
    delivery.ack().await.unwrap();

    transport.close().await.unwrap();
}
