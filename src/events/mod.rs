//! Append-only event log over store streams.
//!
//! Every event goes to the global stream and, when it names them, to its
//! entity stream and its user stream. Consumers read through consumer groups
//! with at-least-once delivery; replay reads a stream range directly.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::handler::HandlerError;
use crate::store::StoreError;

mod log;

pub use log::{ConsumeFilter, EventLog, EventPublication, EventStats, StreamAppend};

/// Result type for event log operations.
pub type Result<T> = std::result::Result<T, EventError>;

/// Errors that can occur during event log operations.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Event serialization error: {0}")]
    Serialization(String),

    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
}

impl From<serde_json::Error> for EventError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Kinds of events the log carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "user.created")]
    UserCreated,
    #[serde(rename = "user.updated")]
    UserUpdated,
    #[serde(rename = "user.deleted")]
    UserDeleted,
    #[serde(rename = "entity.created")]
    EntityCreated,
    #[serde(rename = "entity.updated")]
    EntityUpdated,
    #[serde(rename = "entity.deleted")]
    EntityDeleted,
    #[serde(rename = "cache.invalidated")]
    CacheInvalidated,
    #[serde(rename = "metric.recorded")]
    MetricRecorded,
    #[serde(rename = "system.alert")]
    SystemAlert,
}

impl EventType {
    pub const ALL: [EventType; 9] = [
        EventType::UserCreated,
        EventType::UserUpdated,
        EventType::UserDeleted,
        EventType::EntityCreated,
        EventType::EntityUpdated,
        EventType::EntityDeleted,
        EventType::CacheInvalidated,
        EventType::MetricRecorded,
        EventType::SystemAlert,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserCreated => "user.created",
            Self::UserUpdated => "user.updated",
            Self::UserDeleted => "user.deleted",
            Self::EntityCreated => "entity.created",
            Self::EntityUpdated => "entity.updated",
            Self::EntityDeleted => "entity.deleted",
            Self::CacheInvalidated => "cache.invalidated",
            Self::MetricRecorded => "metric.recorded",
            Self::SystemAlert => "system.alert",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EventError::UnknownEventType(s.to_string()))
    }
}

/// An immutable logged event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_id: String,
    pub event_type: EventType,
    pub timestamp_epoch_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// An event to publish. Id and timestamp are assigned on publish.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_type: EventType,
    pub payload: Value,
    pub user_id: Option<String>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub metadata: Option<Value>,
}

impl NewEvent {
    pub fn new(event_type: EventType, payload: Value) -> Self {
        Self {
            event_type,
            payload,
            user_id: None,
            entity_type: None,
            entity_id: None,
            metadata: None,
        }
    }

    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn for_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Handler for events delivered by [`EventLog::consume`].
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: Arc<Event>) -> BoxFuture<'static, std::result::Result<(), HandlerError>>;
}

impl<F, Fut> EventHandler for F
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, event: Arc<Event>) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        Box::pin(self(event))
    }
}
