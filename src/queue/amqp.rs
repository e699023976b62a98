//! AMQP (RabbitMQ) queue transport.
//!
//! One durable queue per routing key, `{servicePrefix}_{routingKey}`, bound to
//! a durable direct exchange by the routing key. Queues are declared with
//! `x-max-priority` so message priorities are honored by the broker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use dashmap::DashSet;
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, ExchangeKind,
};
use tracing::{debug, error, info, warn};

use crate::utils::retry::{is_retryable_queue_error, publish_backoff};

use super::{
    queue_name, AmqpQueueConfig, DeliveryAcker, DeliveryStream, QueueDelivery, QueueError,
    QueueTransport, Result, MAX_PRIORITY,
};

const PUBLISH_RETRIES: usize = 3;

struct AmqpAcker(Acker);

#[async_trait]
impl DeliveryAcker for AmqpAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| QueueError::Ack(format!("Failed to ack: {}", e)))
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| QueueError::Ack(format!("Failed to nack: {}", e)))
    }
}

/// RabbitMQ transport over a deadpool-lapin connection pool.
pub struct AmqpTransport {
    pool: Pool,
    exchange: String,
    service_prefix: String,
    prefetch: u16,
    connected: AtomicBool,
    declared: DashSet<String>,
}

impl AmqpTransport {
    /// Connect, verify the connection, and declare the exchange.
    pub async fn connect(config: &AmqpQueueConfig, service_prefix: &str) -> Result<Self> {
        let manager = Manager::new(config.url.clone(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(config.pool_size)
            .build()
            .map_err(|e| QueueError::Connection(format!("Failed to create pool: {}", e)))?;

        let conn = pool
            .get()
            .await
            .map_err(|e| QueueError::Connection(format!("Failed to connect: {}", e)))?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| QueueError::Connection(format!("Failed to create channel: {}", e)))?;

        channel
            .exchange_declare(
                &config.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Connection(format!("Failed to declare exchange: {}", e)))?;

        info!(exchange = %config.exchange, url = %config.url, "Connected to AMQP");

        Ok(Self {
            pool,
            exchange: config.exchange.clone(),
            service_prefix: service_prefix.to_string(),
            prefetch: config.prefetch,
            connected: AtomicBool::new(true),
            declared: DashSet::new(),
        })
    }

    async fn channel(&self) -> Result<Channel> {
        let conn = self.pool.get().await.map_err(|e: PoolError| {
            self.connected.store(false, Ordering::SeqCst);
            QueueError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;
        self.connected.store(true, Ordering::SeqCst);

        conn.create_channel()
            .await
            .map_err(|e| QueueError::Connection(format!("Failed to create channel: {}", e)))
    }

    /// Declare the priority queue for `routing_key` and bind it to the exchange.
    async fn declare_queue(&self, channel: &Channel, routing_key: &str) -> Result<String> {
        let queue = queue_name(&self.service_prefix, routing_key);

        let mut arguments = FieldTable::default();
        arguments.insert(
            "x-max-priority".into(),
            AMQPValue::LongInt(i32::from(MAX_PRIORITY)),
        );

        channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(|e| QueueError::Subscribe(format!("Failed to declare queue: {}", e)))?;

        channel
            .queue_bind(
                &queue,
                &self.exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Subscribe(format!("Failed to bind queue: {}", e)))?;

        debug!(queue = %queue, routing_key = %routing_key, "Bound queue to exchange");
        self.declared.insert(queue.clone());
        Ok(queue)
    }

    async fn publish_once(&self, routing_key: &str, payload: &[u8], priority: u8) -> Result<()> {
        let channel = self.channel().await?;
        if !self
            .declared
            .contains(&queue_name(&self.service_prefix, routing_key))
        {
            self.declare_queue(&channel, routing_key).await?;
        }

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2)
            .with_priority(priority.min(MAX_PRIORITY));

        let confirm = channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| QueueError::Publish(format!("Failed to publish: {}", e)))?;

        confirm
            .await
            .map_err(|e| QueueError::Publish(format!("Publish confirmation failed: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl QueueTransport for AmqpTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.pool.is_closed()
    }

    #[tracing::instrument(name = "queue.publish", skip_all, fields(routing_key = %routing_key))]
    async fn publish(&self, routing_key: &str, payload: &[u8], priority: u8) -> Result<()> {
        let backoff = publish_backoff(PUBLISH_RETRIES).build();

        let mut last_error = None;
        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }
            match self.publish_once(routing_key, payload, priority).await {
                Ok(()) => {
                    debug!(exchange = %self.exchange, priority = priority, "Published to queue");
                    return Ok(());
                }
                Err(e) if !is_retryable_queue_error(&e) => {
                    error!(error = %e, "Queue publish failed, not retrying");
                    return Err(e);
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "Queue publish failed");
                    last_error = Some(e);
                }
            }
        }

        let e = last_error
            .unwrap_or_else(|| QueueError::Publish("Publish retries exhausted".to_string()));
        error!(error = %e, "Queue publish gave up");
        Err(e)
    }

    async fn subscribe(&self, routing_key: &str) -> Result<DeliveryStream> {
        let channel = self.channel().await?;
        let queue = self.declare_queue(&channel, routing_key).await?;

        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| QueueError::Subscribe(format!("Failed to set prefetch: {}", e)))?;

        let consumer_tag = format!("{}-{}", queue, std::process::id());
        let consumer = channel
            .basic_consume(
                &queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        info!(queue = %queue, routing_key = %routing_key, "Queue consumer started");

        // The stream owns the channel so it stays open while deliveries flow.
        let stream = consumer.map(move |delivery| {
            let _channel = &channel;
            delivery
                .map(|delivery| {
                    QueueDelivery::new(
                        delivery.data,
                        delivery.redelivered,
                        Box::new(AmqpAcker(delivery.acker)),
                    )
                })
                .map_err(|e| QueueError::Subscribe(format!("Delivery error: {}", e)))
        });

        Ok(Box::pin(stream))
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.pool.close();
        info!(exchange = %self.exchange, "AMQP transport closed");
        Ok(())
    }
}
