//! Routing-key registry dispatching broker messages to handlers.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::{BusError, HybridBroker, Message, MessageHandler, Result, Transport};
use crate::consumer::{ConsumerHandle, ConsumerOptions};
use crate::handler::HandlerError;

/// Registry of handlers keyed by routing key.
#[derive(Default)]
pub struct MessageDispatcher {
    handlers: RwLock<HashMap<String, Vec<Arc<dyn MessageHandler>>>>,
}

impl MessageDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler for `routing_key`. Handlers run in registration order.
    pub async fn register(&self, routing_key: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        let routing_key = routing_key.into();
        let mut handlers = self.handlers.write().await;
        let entry = handlers.entry(routing_key.clone()).or_default();
        entry.push(handler);
        info!(routing_key = %routing_key, handlers = entry.len(), "Registered message handler");
    }

    /// Registered routing keys, sorted.
    pub async fn routing_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Run every handler registered for the message's routing key.
    ///
    /// All handlers run even if one fails; the call fails if any did.
    pub async fn dispatch(&self, message: Arc<Message>) -> Result<()> {
        let handlers = match self.handlers.read().await.get(&message.routing_key) {
            Some(handlers) if !handlers.is_empty() => handlers.clone(),
            _ => return Err(BusError::NoHandler(message.routing_key.clone())),
        };

        let mut failures = Vec::new();
        for handler in handlers {
            if let Err(e) = handler.handle(Arc::clone(&message)).await {
                error!(
                    routing_key = %message.routing_key,
                    message_id = %message.message_id,
                    error = %e,
                    "Handler failed"
                );
                failures.push(e.to_string());
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BusError::HandlerFailed {
                routing_key: message.routing_key.clone(),
                message: failures.join("; "),
            })
        }
    }

    /// Start one broker consumer per registered routing key.
    ///
    /// Handlers registered after this call are picked up for routing keys
    /// that were already registered; new routing keys need another `start`.
    pub async fn start(
        self: &Arc<Self>,
        broker: &HybridBroker,
        transport: Transport,
        options: ConsumerOptions,
    ) -> ConsumerHandle {
        let mut handle = ConsumerHandle::new(CancellationToken::new());
        for routing_key in self.routing_keys().await {
            let dispatcher = Arc::clone(self);
            let route: Arc<dyn MessageHandler> = Arc::new(move |message: Arc<Message>| {
                let dispatcher = Arc::clone(&dispatcher);
                async move {
                    dispatcher
                        .dispatch(message)
                        .await
                        .map_err(|e| HandlerError::new(e.to_string()))
                }
            });
            handle.absorb(broker.consume_messages(&routing_key, route, transport, options.clone()));
        }
        info!(consumers = handle.task_count(), transport = %transport, "Dispatcher started");
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::queue::MemoryQueue;
    use crate::store::MemoryStore;
    use crate::bus::Priority;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn message(routing_key: &str) -> Arc<Message> {
        Arc::new(Message {
            message_id: "m1".to_string(),
            timestamp_epoch_ms: 0,
            priority: Priority::Normal,
            routing_key: routing_key.to_string(),
            transport: Transport::Stream,
            payload: json!({}),
            source: "test".to_string(),
        })
    }

    fn counting(counter: Arc<AtomicUsize>) -> Arc<dyn MessageHandler> {
        Arc::new(move |_message: Arc<Message>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<(), HandlerError>(()) }
        })
    }

    fn failing() -> Arc<dyn MessageHandler> {
        Arc::new(|_message: Arc<Message>| async { Err::<(), HandlerError>(HandlerError::new("boom")) })
    }

    #[tokio::test]
    async fn test_routing_keys_sorted() {
        let dispatcher = MessageDispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));
        dispatcher.register("orders.shipped", counting(calls.clone())).await;
        dispatcher.register("orders.created", counting(calls.clone())).await;
        dispatcher.register("orders.created", counting(calls)).await;

        assert_eq!(
            dispatcher.routing_keys().await,
            vec!["orders.created", "orders.shipped"]
        );
    }

    #[tokio::test]
    async fn test_dispatch_runs_every_handler() {
        let dispatcher = MessageDispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));
        dispatcher.register("rk", counting(calls.clone())).await;
        dispatcher.register("rk", counting(calls.clone())).await;

        dispatcher.dispatch(message("rk")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dispatch_without_handler() {
        let dispatcher = MessageDispatcher::new();
        let result = dispatcher.dispatch(message("nobody")).await;
        assert!(matches!(result, Err(BusError::NoHandler(key)) if key == "nobody"));
    }

    #[tokio::test]
    async fn test_dispatch_fails_if_any_handler_fails() {
        let dispatcher = MessageDispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));
        dispatcher.register("rk", failing()).await;
        dispatcher.register("rk", counting(calls.clone())).await;

        let result = dispatcher.dispatch(message("rk")).await;
        assert!(matches!(result, Err(BusError::HandlerFailed { .. })));
        // Later handlers still ran.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_consumes_each_routing_key() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let queue = Arc::new(MemoryQueue::new("svc"));
        let broker = HybridBroker::new(store, Some(queue), clock, "messages", "svc");

        let dispatcher = Arc::new(MessageDispatcher::new());
        let created = Arc::new(AtomicUsize::new(0));
        let shipped = Arc::new(AtomicUsize::new(0));
        dispatcher.register("created", counting(created.clone())).await;
        dispatcher.register("shipped", counting(shipped.clone())).await;

        let options = ConsumerOptions::new("dispatch")
            .with_consumer("d1")
            .with_block(None)
            .with_backoff(Duration::from_millis(5), Duration::from_millis(5));
        let handle = dispatcher.start(&broker, Transport::Both, options).await;
        assert_eq!(handle.task_count(), 4);

        broker
            .publish_message(json!({}), "created", Priority::Normal, Transport::Stream)
            .await
            .unwrap();
        broker
            .publish_message(json!({}), "shipped", Priority::High, Transport::Queue)
            .await
            .unwrap();

        for _ in 0..400 {
            if created.load(Ordering::SeqCst) == 1 && shipped.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.shutdown().await;

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(shipped.load(Ordering::SeqCst), 1);
    }
}
