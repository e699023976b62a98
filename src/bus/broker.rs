//! Dual-transport publish and consume.
//!
//! The stream leg appends the envelope to `{messagesPrefix}:{routingKey}` and
//! is consumed through a consumer group. The queue leg publishes the same
//! envelope, persistent and prioritized, to the durable queue for the routing
//! key. Either leg can be used alone.

use std::sync::Arc;

use backon::BackoffBuilder;
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{BusError, Message, MessageHandler, Priority, Result, Transport};
use crate::clock::Clock;
use crate::consumer::{spawn_group_loop, ConsumerHandle, ConsumerOptions};
use crate::handler::DispatchResult;
use crate::queue::{QueueDelivery, QueueTransport};
use crate::store::{KeyValueStore, StreamEntry};
use crate::utils::retry::{reconnect_backoff, RECONNECT_MAX_DELAY};

/// Stream field holding the JSON-encoded message.
const DATA_FIELD: &str = "data";

/// What happened on one transport leg of a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegOutcome {
    /// Accepted. Carries the stream entry id for the stream leg.
    Published(Option<String>),
    /// Queue transport absent or disconnected; the leg was skipped.
    Degraded,
    /// The leg was attempted and failed.
    Failed(String),
    /// The requested transport does not include this leg.
    Skipped,
}

impl LegOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, Self::Published(_))
    }
}

/// Result of one publish.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishReceipt {
    pub message: Message,
    pub stream: LegOutcome,
    pub queue: LegOutcome,
}

impl PublishReceipt {
    /// True if at least one leg accepted the message.
    pub fn accepted(&self) -> bool {
        self.stream.is_published() || self.queue.is_published()
    }

    pub fn degraded(&self) -> bool {
        self.queue == LegOutcome::Degraded
    }
}

/// Broker combining a store stream with an optional durable queue transport.
#[derive(Clone)]
pub struct HybridBroker {
    store: Arc<dyn KeyValueStore>,
    queue: Option<Arc<dyn QueueTransport>>,
    clock: Arc<dyn Clock>,
    prefix: String,
    source: String,
}

impl HybridBroker {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        queue: Option<Arc<dyn QueueTransport>>,
        clock: Arc<dyn Clock>,
        messages_prefix: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            store,
            queue,
            clock,
            prefix: messages_prefix.into(),
            source: source.into(),
        }
    }

    pub fn stream_key(&self, routing_key: &str) -> String {
        format!("{}:{}", self.prefix, routing_key)
    }

    /// Whether a queue transport is present and connected.
    pub fn queue_available(&self) -> bool {
        self.queue.as_ref().is_some_and(|q| q.is_connected())
    }

    /// Publish `payload` on the legs selected by `transport`.
    ///
    /// Legs are independent. An error is returned only when no leg accepted
    /// the message and at least one leg failed; a degraded queue leg is
    /// reported in the receipt.
    #[tracing::instrument(
        name = "broker.publish",
        skip_all,
        fields(routing_key = %routing_key, priority = %priority, transport = %transport)
    )]
    pub async fn publish_message(
        &self,
        payload: Value,
        routing_key: &str,
        priority: Priority,
        transport: Transport,
    ) -> Result<PublishReceipt> {
        let message = Message {
            message_id: uuid::Uuid::new_v4().to_string(),
            timestamp_epoch_ms: self.clock.now_epoch_ms(),
            priority,
            routing_key: routing_key.to_string(),
            transport,
            payload,
            source: self.source.clone(),
        };
        let body = serde_json::to_string(&message)?;
        let mut first_error: Option<BusError> = None;

        let stream = if transport.uses_stream() {
            let key = self.stream_key(routing_key);
            let fields = [(DATA_FIELD.to_string(), body.clone())];
            match self.store.xadd(&key, &fields).await {
                Ok(id) => LegOutcome::Published(Some(id)),
                Err(e) => {
                    error!(stream = %key, error = %e, "Stream leg publish failed");
                    let outcome = LegOutcome::Failed(e.to_string());
                    first_error.get_or_insert(e.into());
                    outcome
                }
            }
        } else {
            LegOutcome::Skipped
        };

        let queue = if transport.uses_queue() {
            match &self.queue {
                Some(queue) if queue.is_connected() => {
                    match queue
                        .publish(routing_key, body.as_bytes(), priority.amqp_priority())
                        .await
                    {
                        Ok(()) => LegOutcome::Published(None),
                        Err(e) => {
                            error!(error = %e, "Queue leg publish failed");
                            let outcome = LegOutcome::Failed(e.to_string());
                            first_error.get_or_insert(e.into());
                            outcome
                        }
                    }
                }
                _ => {
                    warn!(
                        message_id = %message.message_id,
                        "Queue transport unavailable, publishing without queue leg"
                    );
                    LegOutcome::Degraded
                }
            }
        } else {
            LegOutcome::Skipped
        };

        let receipt = PublishReceipt {
            message,
            stream,
            queue,
        };
        if !receipt.accepted() {
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        debug!(
            message_id = %receipt.message.message_id,
            stream = ?receipt.stream,
            queue = ?receipt.queue,
            "Published message"
        );
        Ok(receipt)
    }

    /// Start consumers for `routing_key` on the legs selected by `transport`.
    ///
    /// Stream leg: success acks, failure leaves the entry pending.
    /// Queue leg: success acks, failure requeues, undecodable payloads are
    /// rejected without requeue.
    pub fn consume_messages(
        &self,
        routing_key: &str,
        handler: Arc<dyn MessageHandler>,
        transport: Transport,
        options: ConsumerOptions,
    ) -> ConsumerHandle {
        let token = CancellationToken::new();
        let mut handle = ConsumerHandle::new(token.clone());

        if transport.uses_stream() {
            let handler = handler.clone();
            handle.push(spawn_group_loop(
                self.store.clone(),
                self.stream_key(routing_key),
                options,
                token.clone(),
                move |entry| {
                    let handler = handler.clone();
                    async move { process_entry(entry, handler).await.entry_outcome() }
                },
            ));
        }

        if transport.uses_queue() {
            match &self.queue {
                Some(queue) => {
                    let queue = queue.clone();
                    let routing_key = routing_key.to_string();
                    let token = token.clone();
                    handle.push(tokio::spawn(async move {
                        run_queue_loop(queue, &routing_key, handler, &token).await;
                    }));
                }
                None => {
                    warn!(
                        routing_key = %routing_key,
                        "No queue transport configured, consuming stream leg only"
                    );
                }
            }
        }

        handle
    }
}

fn decode_entry(entry: &StreamEntry) -> std::result::Result<Message, String> {
    let data = entry
        .field(DATA_FIELD)
        .ok_or_else(|| format!("missing '{}' field", DATA_FIELD))?;
    serde_json::from_str(data).map_err(|e| e.to_string())
}

async fn deliver(message: Message, handler: &dyn MessageHandler) -> DispatchResult {
    let message_id = message.message_id.clone();
    match handler.handle(Arc::new(message)).await {
        Ok(()) => DispatchResult::Success,
        Err(e) => {
            warn!(message_id = %message_id, error = %e, "Message handler failed");
            DispatchResult::HandlerFailed
        }
    }
}

async fn process_entry(entry: StreamEntry, handler: Arc<dyn MessageHandler>) -> DispatchResult {
    match decode_entry(&entry) {
        Ok(message) => deliver(message, handler.as_ref()).await,
        Err(reason) => {
            error!(id = %entry.id, reason = %reason, "Failed to decode message");
            DispatchResult::DecodeError
        }
    }
}

async fn process_delivery(delivery: QueueDelivery, handler: &dyn MessageHandler) -> DispatchResult {
    let decoded = serde_json::from_slice::<Message>(&delivery.payload);
    let (result, settled) = match decoded {
        Ok(message) => {
            let result = deliver(message, handler).await;
            let settled = if result.should_ack() {
                delivery.ack().await
            } else {
                delivery.nack(true).await
            };
            (result, settled)
        }
        Err(e) => {
            error!(error = %e, "Failed to decode queued message, rejecting");
            (DispatchResult::DecodeError, delivery.nack(false).await)
        }
    };

    if let Err(e) = settled {
        error!(error = %e, "Failed to settle delivery");
    }
    result
}

/// Queue consumer with automatic resubscription and exponential backoff.
async fn run_queue_loop(
    queue: Arc<dyn QueueTransport>,
    routing_key: &str,
    handler: Arc<dyn MessageHandler>,
    token: &CancellationToken,
) {
    let backoff_builder = reconnect_backoff();
    let mut backoff_iter = backoff_builder.build();

    'outer: loop {
        if token.is_cancelled() {
            break;
        }

        let subscribed = tokio::select! {
            _ = token.cancelled() => break,
            subscribed = queue.subscribe(routing_key) => subscribed,
        };

        match subscribed {
            Ok(mut deliveries) => {
                info!(routing_key = %routing_key, "Queue consumer subscribed");
                backoff_iter = backoff_builder.build();

                loop {
                    let next = tokio::select! {
                        _ = token.cancelled() => break 'outer,
                        next = deliveries.next() => next,
                    };
                    match next {
                        Some(Ok(delivery)) => {
                            process_delivery(delivery, handler.as_ref()).await;
                        }
                        Some(Err(e)) => {
                            error!(routing_key = %routing_key, error = %e, "Queue delivery error, resubscribing");
                            break;
                        }
                        None => {
                            info!(routing_key = %routing_key, "Queue delivery stream ended, resubscribing");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                error!(routing_key = %routing_key, error = %e, "Queue subscribe failed");
            }
        }

        let delay = backoff_iter.next().unwrap_or(RECONNECT_MAX_DELAY);
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    info!(routing_key = %routing_key, "Queue consumer stopped");
}
