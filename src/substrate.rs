//! Shared connection handles and component construction.
//!
//! A [`Substrate`] owns one store handle and one optional queue transport.
//! Every component it builds shares them, so a process opens each
//! connection once regardless of how many caches, logs or consumers it runs.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::bus::{HybridBroker, MessageDispatcher};
use crate::cache::{
    AggregationCache, CacheCoordinator, CacheKind, DashboardCache, MetricCache, QueryCache,
    SingleFlight,
};
use crate::clock::{system_clock, Clock};
use crate::config::Config;
use crate::consumer::ConsumerOptions;
use crate::data::StructuredDataService;
use crate::events::EventLog;
use crate::queue::{init_queue, QueueError, QueueTransport, QueueType};
use crate::store::{init_store, KeyValueStore, StoreError};
use crate::utils::bootstrap::connect_with_retry;
use crate::utils::retry::is_retryable_store_error;

/// Result type for substrate lifecycle operations.
pub type Result<T> = std::result::Result<T, SubstrateError>;

/// Errors raised while loading configuration or opening connections.
#[derive(Debug, thiserror::Error)]
pub enum SubstrateError {
    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Connected store and queue handles plus the configuration they came from.
#[derive(Clone)]
pub struct Substrate {
    config: Config,
    store: Arc<dyn KeyValueStore>,
    queue: Option<Arc<dyn QueueTransport>>,
    clock: Arc<dyn Clock>,
    single_flight: SingleFlight,
    event_appends: Arc<Mutex<()>>,
}

impl Substrate {
    /// Load configuration (see [`Config::load`]) and connect.
    pub async fn from_config_file(path: Option<&str>) -> Result<Self> {
        let config = Config::load(path)?;
        Self::connect(config).await
    }

    /// Connect the store, retrying connection failures, then the queue.
    ///
    /// A queue that cannot be reached leaves the substrate degraded: brokers
    /// it builds publish stream-only.
    pub async fn connect(config: Config) -> Result<Self> {
        let clock = system_clock();

        let store = connect_with_retry(
            "store",
            || init_store(&config.store, clock.clone()),
            is_retryable_store_error,
        )
        .await?;

        let queue = match init_queue(&config.queue, &config.service.name).await {
            Ok(queue) => queue,
            Err(e) => {
                warn!(error = %e, "Queue transport unavailable, starting degraded");
                None
            }
        };

        info!(
            service = %config.service.name,
            queue = queue.is_some(),
            "Substrate connected"
        );
        Ok(Self::from_parts(config, store, queue, clock))
    }

    /// Assemble a substrate from existing handles.
    pub fn from_parts(
        config: Config,
        store: Arc<dyn KeyValueStore>,
        queue: Option<Arc<dyn QueueTransport>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            queue,
            clock,
            single_flight: SingleFlight::new(),
            event_appends: Arc::new(Mutex::new(())),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn queue(&self) -> Option<&Arc<dyn QueueTransport>> {
        self.queue.as_ref()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// True when a queue transport is configured but not usable.
    pub fn is_degraded(&self) -> bool {
        self.config.queue.queue_type != QueueType::None
            && !self.queue.as_ref().is_some_and(|q| q.is_connected())
    }

    /// Cache coordinator for `kind`. Coordinators share one single-flight
    /// registry when it is enabled.
    pub fn cache(&self, kind: CacheKind) -> CacheCoordinator {
        let gates = self
            .config
            .cache
            .single_flight
            .then(|| self.single_flight.clone());
        CacheCoordinator::new(self.store.clone(), self.clock.clone(), kind)
            .with_default_ttl(self.config.cache.default_ttl_secs)
            .with_single_flight(gates)
    }

    pub fn query_cache(&self) -> QueryCache {
        QueryCache::new(self.cache(CacheKind::Query))
    }

    pub fn aggregation_cache(&self) -> AggregationCache {
        AggregationCache::new(self.cache(CacheKind::Aggregation))
    }

    pub fn dashboard_cache(&self) -> DashboardCache {
        DashboardCache::new(self.cache(CacheKind::Dashboard))
    }

    pub fn metric_cache(&self) -> MetricCache {
        MetricCache::new(self.cache(CacheKind::Metric))
    }

    pub fn data(&self) -> StructuredDataService {
        StructuredDataService::new(self.store.clone(), self.config.namespaces.data.clone())
    }

    /// Event log over the shared store. Logs built here serialize their
    /// appends with each other.
    pub fn event_log(&self) -> EventLog {
        EventLog::new(
            self.store.clone(),
            self.clock.clone(),
            self.config.namespaces.events.clone(),
        )
        .with_append_lock(self.event_appends.clone())
    }

    pub fn broker(&self) -> HybridBroker {
        HybridBroker::new(
            self.store.clone(),
            self.queue.clone(),
            self.clock.clone(),
            self.config.namespaces.messages.clone(),
            self.config.service.name.clone(),
        )
    }

    pub fn dispatcher(&self) -> Arc<MessageDispatcher> {
        Arc::new(MessageDispatcher::new())
    }

    /// Consumer settings from the `consumer` config section.
    pub fn consumer_options(&self) -> ConsumerOptions {
        self.config.consumer.to_options()
    }

    /// Close the queue transport. The store connection closes on drop.
    pub async fn close(&self) -> Result<()> {
        if let Some(queue) = &self.queue {
            queue.close().await?;
        }
        info!(service = %self.config.service.name, "Substrate closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::queue::MemoryQueue;
    use crate::store::MemoryStore;

    fn substrate(queue: Option<Arc<MemoryQueue>>) -> Substrate {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let queue = queue.map(|q| q as Arc<dyn QueueTransport>);
        Substrate::from_parts(Config::for_test(), store, queue, clock)
    }

    #[tokio::test]
    async fn test_connect_with_memory_backends() {
        let substrate = Substrate::connect(Config::for_test()).await.unwrap();
        assert!(substrate.queue().is_some());
        assert!(!substrate.is_degraded());
        substrate.close().await.unwrap();
        assert!(substrate.is_degraded());
    }

    #[tokio::test]
    async fn test_no_queue_configured_is_not_degraded() {
        let mut config = Config::for_test();
        config.queue.queue_type = QueueType::None;
        let substrate = Substrate::connect(config).await.unwrap();
        assert!(substrate.queue().is_none());
        assert!(!substrate.is_degraded());
    }

    #[test]
    fn test_components_use_configured_namespaces() {
        let substrate = substrate(Some(Arc::new(MemoryQueue::new("svc"))));
        assert_eq!(substrate.event_log().main_stream(), "events:main");
        assert_eq!(substrate.broker().stream_key("rk"), "messages:rk");
        assert_eq!(substrate.data().prefix(), "data");
        assert_eq!(substrate.query_cache().coordinator().kind(), CacheKind::Query);
        assert_eq!(substrate.cache(CacheKind::Metric).default_ttl(), 300);
    }

    #[tokio::test]
    async fn test_event_logs_agree_on_stream_order() {
        let substrate = substrate(None);
        let logs = [substrate.event_log(), substrate.event_log()];

        let publishes = (0..20).map(|n| {
            let log = &logs[n % 2];
            log.publish(
                crate::NewEvent::new(crate::EventType::EntityUpdated, serde_json::json!({"n": n}))
                    .for_entity("order", "1"),
            )
        });
        for publication in futures::future::join_all(publishes).await {
            publication.unwrap();
        }

        let main: Vec<String> = logs[0]
            .replay_global(0, None)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_id)
            .collect();
        let entity: Vec<String> = logs[1]
            .replay("order", "1", 0)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_id)
            .collect();
        assert_eq!(main.len(), 20);
        assert_eq!(main, entity);
    }

    #[test]
    fn test_missing_queue_is_degraded() {
        assert!(substrate(None).is_degraded());
    }
}
