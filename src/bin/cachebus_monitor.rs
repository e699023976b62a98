//! cachebus-monitor: logging consumer for broker traffic
//!
//! Connects with the regular configuration, logs event log and structured
//! data statistics once, then logs every message published on the monitored
//! routing keys until Ctrl-C.
//!
//! ## Configuration
//! - First argument: config file path (optional, see `Config::load`)
//! - CACHEBUS_MONITOR_KEYS: comma-separated routing keys to follow
//!
//! The monitor reads the stream leg only, in the consumer group
//! `{consumer.group}-monitor`, so it sees every message without taking work
//! from real consumers. Durable queues are shared by all consumers of a
//! service and are never read here.

use std::sync::Arc;

use tracing::{info, warn};

use cachebus::bus::{Message, Transport};
use cachebus::utils::bootstrap::init_tracing;
use cachebus::{ConsumerHandle, HandlerError, Substrate};

const KEYS_ENV_VAR: &str = "CACHEBUS_MONITOR_KEYS";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let substrate = Substrate::from_config_file(config_path.as_deref()).await?;

    let routing_keys: Vec<String> = std::env::var(KEYS_ENV_VAR)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect();

    let events = substrate.event_log().get_stats().await?;
    info!(
        streams = events.streams,
        entries = events.total_entries,
        "Event log"
    );
    let data = substrate.data().get_stats().await?;
    for (kind, stats) in &data.kinds {
        info!(kind = %kind, keys = stats.keys, elements = stats.elements, "Structured data");
    }
    if substrate.is_degraded() {
        warn!("Queue transport unavailable, publishers fall back to streams");
    }

    if routing_keys.is_empty() {
        warn!(env = KEYS_ENV_VAR, "No routing keys to monitor");
        substrate.close().await?;
        return Ok(());
    }

    let broker = substrate.broker();
    let mut options = substrate.consumer_options();
    options.group = format!("{}-monitor", options.group);
    options.consumer = format!("{}-{}", options.group, std::process::id());

    let mut consumers: Option<ConsumerHandle> = None;
    for routing_key in &routing_keys {
        let handle = broker.consume_messages(
            routing_key,
            Arc::new(log_message),
            Transport::Stream,
            options.clone(),
        );
        match consumers.as_mut() {
            Some(all) => all.absorb(handle),
            None => consumers = Some(handle),
        }
    }

    info!(routing_keys = ?routing_keys, "cachebus-monitor started");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    if let Some(consumers) = consumers {
        consumers.shutdown().await;
    }
    substrate.close().await?;
    Ok(())
}

async fn log_message(message: Arc<Message>) -> Result<(), HandlerError> {
    info!(
        routing_key = %message.routing_key,
        message_id = %message.message_id,
        priority = %message.priority,
        source = %message.source,
        payload = %message.payload,
        "Message"
    );
    Ok(())
}
