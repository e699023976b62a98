//! Durable queue transport (the broker's second leg).
//!
//! This module contains:
//! - `QueueTransport` trait: publish with persistence + priority, subscribe
//!   with explicit ack / nack-requeue
//! - `QueueDelivery`: one pushed message and its acknowledgment handle
//! - Queue configuration and the `init_queue` factory
//! - Implementations: AMQP (RabbitMQ), in-memory

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Deserialize;
use tracing::{info, warn};

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

#[cfg(feature = "amqp")]
pub use amqp::AmqpTransport;
pub use memory::MemoryQueue;

/// Highest priority a queue accepts (`x-max-priority`).
pub const MAX_PRIORITY: u8 = 10;

// ============================================================================
// Errors
// ============================================================================

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors that can occur during queue transport operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue connection failed: {0}")]
    Connection(String),

    #[error("Queue publish failed: {0}")]
    Publish(String),

    #[error("Queue subscribe failed: {0}")]
    Subscribe(String),

    #[error("Queue acknowledgment failed: {0}")]
    Ack(String),
}

// ============================================================================
// Deliveries
// ============================================================================

/// Settles one delivery with the transport.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(self: Box<Self>) -> Result<()>;
    /// Negative acknowledgment; `requeue` puts the message back for redelivery.
    async fn nack(self: Box<Self>, requeue: bool) -> Result<()>;
}

/// A message pushed by the queue transport.
pub struct QueueDelivery {
    pub payload: Vec<u8>,
    /// True if the transport has delivered this message before.
    pub redelivered: bool,
    acker: Box<dyn DeliveryAcker>,
}

impl QueueDelivery {
    pub fn new(payload: Vec<u8>, redelivered: bool, acker: Box<dyn DeliveryAcker>) -> Self {
        Self {
            payload,
            redelivered,
            acker,
        }
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for QueueDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueDelivery")
            .field("payload_len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Stream of deliveries for one routing key.
pub type DeliveryStream = BoxStream<'static, Result<QueueDelivery>>;

// ============================================================================
// Trait
// ============================================================================

/// Interface to the durable, priority-aware queue transport.
///
/// Implementations:
/// - `AmqpTransport`: RabbitMQ via AMQP 0.9.1
/// - `MemoryQueue`: in-process priority queues for standalone mode and tests
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Whether the transport currently holds a live connection.
    fn is_connected(&self) -> bool;

    /// Publish a persistent message to the durable queue bound to `routing_key`.
    async fn publish(&self, routing_key: &str, payload: &[u8], priority: u8) -> Result<()>;

    /// Start receiving messages routed by `routing_key`.
    ///
    /// Each delivery must be settled with `ack` or `nack`.
    async fn subscribe(&self, routing_key: &str) -> Result<DeliveryStream>;

    /// Release the connection.
    async fn close(&self) -> Result<()>;
}

/// Durable queue name for a routing key: `{servicePrefix}_{routingKey}`.
pub fn queue_name(service_prefix: &str, routing_key: &str) -> String {
    format!("{}_{}", service_prefix, routing_key)
}

// ============================================================================
// Configuration
// ============================================================================

/// Queue transport discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueType {
    /// AMQP/RabbitMQ.
    #[default]
    Amqp,
    /// In-process queues.
    Memory,
    /// No secondary transport; the broker runs stream-only.
    None,
}

/// Queue transport configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue type discriminator.
    #[serde(rename = "type")]
    pub queue_type: QueueType,
    /// AMQP-specific configuration.
    pub amqp: AmqpQueueConfig,
}

/// AMQP-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpQueueConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Direct exchange the per-routing-key queues are bound to.
    pub exchange: String,
    /// Connection pool size.
    pub pool_size: usize,
    /// Unacknowledged deliveries a consumer may hold.
    pub prefetch: u16,
}

impl Default for AmqpQueueConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            exchange: "cachebus.direct".to_string(),
            pool_size: 10,
            prefetch: 16,
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize the queue transport based on configuration.
///
/// Returns `Ok(None)` when no secondary transport is configured. Connection
/// failures are returned so the caller can decide whether to run degraded.
pub async fn init_queue(
    config: &QueueConfig,
    service_prefix: &str,
) -> Result<Option<Arc<dyn QueueTransport>>> {
    match config.queue_type {
        QueueType::Amqp => {
            #[cfg(feature = "amqp")]
            {
                let transport = AmqpTransport::connect(&config.amqp, service_prefix).await?;
                info!(queue_type = "amqp", "Queue transport initialized");
                Ok(Some(Arc::new(transport)))
            }

            #[cfg(not(feature = "amqp"))]
            {
                let _ = service_prefix;
                warn!("AMQP queue requested but the 'amqp' feature is not enabled");
                Err(QueueError::Connection(
                    "AMQP support requires the 'amqp' feature. Rebuild with --features amqp"
                        .to_string(),
                ))
            }
        }
        QueueType::Memory => {
            info!(queue_type = "memory", "Queue transport initialized");
            Ok(Some(Arc::new(MemoryQueue::new(service_prefix))))
        }
        QueueType::None => {
            warn!("No queue transport configured, broker runs stream-only");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_name() {
        assert_eq!(queue_name("orders-svc", "orders.created"), "orders-svc_orders.created");
    }

    #[test]
    fn test_queue_config_default() {
        let config = QueueConfig::default();
        assert_eq!(config.queue_type, QueueType::Amqp);
        assert_eq!(config.amqp.url, "amqp://localhost:5672");
        assert_eq!(config.amqp.exchange, "cachebus.direct");
    }

    #[tokio::test]
    async fn test_init_none_queue() {
        let config = QueueConfig {
            queue_type: QueueType::None,
            ..Default::default()
        };
        assert!(init_queue(&config, "svc").await.unwrap().is_none());
    }
}
