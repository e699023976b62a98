//! In-memory priority queues.
//!
//! One queue per routing key, named like the durable queues of the AMQP
//! transport. Higher priorities are delivered first, FIFO within a priority.
//! A nack with requeue puts the message back at its original position.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use super::{
    queue_name, DeliveryAcker, DeliveryStream, QueueDelivery, QueueError, QueueTransport, Result,
};

#[derive(Debug)]
struct QueuedMessage {
    priority: u8,
    seq: u64,
    payload: Vec<u8>,
    redelivered: bool,
}

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedMessage {}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueInner {
    heap: Mutex<BinaryHeap<QueuedMessage>>,
    notify: Notify,
    acked: AtomicU64,
    requeued: AtomicU64,
    rejected: AtomicU64,
}

impl QueueInner {
    async fn push(&self, message: QueuedMessage) {
        self.heap.lock().await.push(message);
        self.notify.notify_one();
    }
}

struct MemoryAcker {
    queue: Arc<QueueInner>,
    message: QueuedMessage,
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.queue.acked.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(())
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<()> {
        let MemoryAcker { queue, mut message } = *self;
        if requeue {
            queue.requeued.fetch_add(1, AtomicOrdering::SeqCst);
            message.redelivered = true;
            queue.push(message).await;
        } else {
            queue.rejected.fetch_add(1, AtomicOrdering::SeqCst);
        }
        Ok(())
    }
}

/// Settlement counters for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounters {
    pub depth: usize,
    pub acked: u64,
    pub requeued: u64,
    pub rejected: u64,
}

/// In-process `QueueTransport`.
pub struct MemoryQueue {
    service_prefix: String,
    queues: Mutex<HashMap<String, Arc<QueueInner>>>,
    next_seq: AtomicU64,
    connected: AtomicBool,
}

impl MemoryQueue {
    pub fn new(service_prefix: impl Into<String>) -> Self {
        Self {
            service_prefix: service_prefix.into(),
            queues: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            connected: AtomicBool::new(true),
        }
    }

    /// Simulate losing or regaining the connection.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, AtomicOrdering::SeqCst);
    }

    async fn queue(&self, routing_key: &str) -> Arc<QueueInner> {
        let name = queue_name(&self.service_prefix, routing_key);
        self.queues.lock().await.entry(name).or_default().clone()
    }

    pub async fn counters(&self, routing_key: &str) -> QueueCounters {
        let queue = self.queue(routing_key).await;
        let depth = queue.heap.lock().await.len();
        QueueCounters {
            depth,
            acked: queue.acked.load(AtomicOrdering::SeqCst),
            requeued: queue.requeued.load(AtomicOrdering::SeqCst),
            rejected: queue.rejected.load(AtomicOrdering::SeqCst),
        }
    }
}

#[async_trait]
impl QueueTransport for MemoryQueue {
    fn is_connected(&self) -> bool {
        self.connected.load(AtomicOrdering::SeqCst)
    }

    async fn publish(&self, routing_key: &str, payload: &[u8], priority: u8) -> Result<()> {
        if !self.is_connected() {
            return Err(QueueError::Connection("Memory queue disconnected".to_string()));
        }
        let queue = self.queue(routing_key).await;
        queue
            .push(QueuedMessage {
                priority,
                seq: self.next_seq.fetch_add(1, AtomicOrdering::SeqCst),
                payload: payload.to_vec(),
                redelivered: false,
            })
            .await;
        debug!(routing_key = %routing_key, priority = priority, "Queued message");
        Ok(())
    }

    async fn subscribe(&self, routing_key: &str) -> Result<DeliveryStream> {
        if !self.is_connected() {
            return Err(QueueError::Subscribe("Memory queue disconnected".to_string()));
        }
        let queue = self.queue(routing_key).await;

        let stream = futures::stream::unfold(queue, |queue| async move {
            loop {
                let next = queue.heap.lock().await.pop();
                if let Some(message) = next {
                    let delivery = QueueDelivery::new(
                        message.payload.clone(),
                        message.redelivered,
                        Box::new(MemoryAcker {
                            queue: queue.clone(),
                            message,
                        }),
                    );
                    return Some((Ok(delivery), queue));
                }
                queue.notify.notified().await;
            }
        });

        Ok(Box::pin(stream))
    }

    async fn close(&self) -> Result<()> {
        self.set_connected(false);
        Ok(())
    }
}
