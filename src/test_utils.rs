//! Test utilities.
//!
//! In-process backends wired into a [`Substrate`] plus handlers that record
//! what they receive, for exercising consumers without Redis or RabbitMQ.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use crate::bus::{Message, MessageHandler};
use crate::clock::ManualClock;
use crate::config::Config;
use crate::consumer::ConsumerOptions;
use crate::events::{Event, EventHandler};
use crate::handler::HandlerError;
use crate::queue::{MemoryQueue, QueueTransport};
use crate::store::MemoryStore;
use crate::substrate::Substrate;

/// Start time of every harness clock.
pub const HARNESS_EPOCH_MS: i64 = 1_700_000_000_000;

/// Substrate over `MemoryStore` and `MemoryQueue` with a manual clock.
pub struct MemoryHarness {
    pub substrate: Substrate,
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryQueue>,
    pub clock: Arc<ManualClock>,
}

impl MemoryHarness {
    pub fn new() -> Self {
        Self::with_config(Config::for_test())
    }

    pub fn with_config(config: Config) -> Self {
        let clock = Arc::new(ManualClock::new(HARNESS_EPOCH_MS));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let queue = Arc::new(MemoryQueue::new(config.service.name.clone()));
        let substrate = Substrate::from_parts(
            config,
            store.clone(),
            Some(queue.clone() as Arc<dyn QueueTransport>),
            clock.clone(),
        );
        Self {
            substrate,
            store,
            queue,
            clock,
        }
    }
}

impl Default for MemoryHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer options that poll without blocking and back off briefly.
pub fn fast_consumer_options(group: &str) -> ConsumerOptions {
    ConsumerOptions::new(group)
        .with_consumer(format!("{}-test", group))
        .with_block(None)
        .with_backoff(Duration::from_millis(5), Duration::from_millis(5))
}

/// Poll `check` every 5ms for up to two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

/// Handler that records every delivery and fails the first `fail_first` calls.
pub struct RecordingHandler<T> {
    received: Mutex<Vec<Arc<T>>>,
    calls: AtomicUsize,
    fail_first: usize,
}

impl<T> RecordingHandler<T> {
    pub fn new() -> Arc<Self> {
        Self::failing_first(0)
    }

    pub fn failing_first(fail_first: usize) -> Arc<Self> {
        Arc::new(Self {
            received: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            fail_first,
        })
    }

    /// Total calls, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Deliveries that were accepted.
    pub fn received(&self) -> Vec<Arc<T>> {
        self.received
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn record(&self, item: Arc<T>) -> Result<(), HandlerError> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_first {
            return Err(HandlerError::new(format!("failure {} of {}", attempt + 1, self.fail_first)));
        }
        if let Ok(mut received) = self.received.lock() {
            received.push(item);
        }
        Ok(())
    }
}

impl MessageHandler for RecordingHandler<Message> {
    fn handle(&self, message: Arc<Message>) -> BoxFuture<'static, Result<(), HandlerError>> {
        let result = self.record(message);
        Box::pin(async move { result })
    }
}

impl EventHandler for RecordingHandler<Event> {
    fn handle(&self, event: Arc<Event>) -> BoxFuture<'static, Result<(), HandlerError>> {
        let result = self.record(event);
        Box::pin(async move { result })
    }
}
