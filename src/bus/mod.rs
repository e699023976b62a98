//! Hybrid message broker.
//!
//! This module contains:
//! - `Message` envelope with closed `Priority` and `Transport` enums
//! - `MessageHandler` trait: for processing delivered messages
//! - `HybridBroker`: fans one publish out to a store stream and a durable
//!   priority queue, and consumes from either
//! - `MessageDispatcher`: routing-key registry on top of the broker

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::handler::HandlerError;
use crate::queue::QueueError;
use crate::store::StoreError;

pub mod broker;
pub mod dispatch;

pub use broker::{HybridBroker, LegOutcome, PublishReceipt};
pub use dispatch::MessageDispatcher;

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Message serialization error: {0}")]
    Serialization(String),

    #[error("Unknown priority: {0}")]
    UnknownPriority(String),

    #[error("Unknown transport: {0}")]
    UnknownTransport(String),

    #[error("No handler registered for routing key '{0}'")]
    NoHandler(String),

    #[error("Handler failed for routing key '{routing_key}': {message}")]
    HandlerFailed { routing_key: String, message: String },
}

impl From<serde_json::Error> for BusError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// Delivery priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// AMQP message priority (queues declare `x-max-priority` 10).
    pub fn amqp_priority(&self) -> u8 {
        match self {
            Self::Low => 1,
            Self::Normal => 5,
            Self::High => 8,
            Self::Critical => 10,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Normal => "NORMAL",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = BusError;

    /// Case-insensitive.
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(Self::Low),
            "NORMAL" => Ok(Self::Normal),
            "HIGH" => Ok(Self::High),
            "CRITICAL" => Ok(Self::Critical),
            _ => Err(BusError::UnknownPriority(s.to_string())),
        }
    }
}

/// Which legs a publish or consume uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Store stream only.
    Stream,
    /// Durable queue only.
    Queue,
    /// Both legs, independently.
    #[default]
    Both,
}

impl Transport {
    pub fn uses_stream(&self) -> bool {
        matches!(self, Self::Stream | Self::Both)
    }

    pub fn uses_queue(&self) -> bool {
        matches!(self, Self::Queue | Self::Both)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Queue => "queue",
            Self::Both => "both",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = BusError;

    /// Case-insensitive.
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "stream" => Ok(Self::Stream),
            "queue" => Ok(Self::Queue),
            "both" => Ok(Self::Both),
            _ => Err(BusError::UnknownTransport(s.to_string())),
        }
    }
}

/// Envelope published on both legs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub message_id: String,
    pub timestamp_epoch_ms: i64,
    pub priority: Priority,
    pub routing_key: String,
    pub transport: Transport,
    pub payload: Value,
    /// Name of the publishing service.
    pub source: String,
}

// ============================================================================
// Handlers
// ============================================================================

/// Handler for messages delivered by the broker.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: Arc<Message>)
        -> BoxFuture<'static, std::result::Result<(), HandlerError>>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(Arc<Message>) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    fn handle(
        &self,
        message: Arc<Message>,
    ) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        Box::pin(self(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_labels() {
        assert_eq!("low".parse::<Priority>().unwrap(), Priority::Low);
        assert_eq!("NORMAL".parse::<Priority>().unwrap(), Priority::Normal);
        assert_eq!("Critical".parse::<Priority>().unwrap(), Priority::Critical);
        assert!(matches!(
            "urgent".parse::<Priority>(),
            Err(BusError::UnknownPriority(label)) if label == "urgent"
        ));
    }

    #[test]
    fn test_priority_amqp_mapping() {
        assert_eq!(Priority::Low.amqp_priority(), 1);
        assert_eq!(Priority::Normal.amqp_priority(), 5);
        assert_eq!(Priority::High.amqp_priority(), 8);
        assert_eq!(Priority::Critical.amqp_priority(), crate::queue::MAX_PRIORITY);
    }

    #[test]
    fn test_transport_labels() {
        assert_eq!("stream".parse::<Transport>().unwrap(), Transport::Stream);
        assert_eq!("QUEUE".parse::<Transport>().unwrap(), Transport::Queue);
        assert_eq!("both".parse::<Transport>().unwrap(), Transport::Both);
        assert!(matches!(
            "carrier-pigeon".parse::<Transport>(),
            Err(BusError::UnknownTransport(_))
        ));
        assert!(Transport::Both.uses_stream() && Transport::Both.uses_queue());
        assert!(!Transport::Stream.uses_queue());
    }

    #[test]
    fn test_message_wire_format() {
        let message = Message {
            message_id: "id".to_string(),
            timestamp_epoch_ms: 7,
            priority: Priority::High,
            routing_key: "orders.created".to_string(),
            transport: Transport::Both,
            payload: json!({"id": 1}),
            source: "orders-svc".to_string(),
        };
        let text = serde_json::to_string(&message).unwrap();
        assert!(text.contains(r#""priority":"HIGH""#));
        assert!(text.contains(r#""transport":"both""#));
        assert!(text.contains(r#""routingKey":"orders.created""#));

        let bad = text.replace("HIGH", "URGENT");
        assert!(serde_json::from_str::<Message>(&bad).is_err());
    }
}
