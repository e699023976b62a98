//! cachebus - Redis-backed cache, event log and hybrid message broker
//!
//! Building blocks over one shared key/value store and an optional AMQP
//! queue transport:
//! - `cache`: read-through caching with tag-based invalidation
//! - `data`: typed hashes, sets, sorted sets, lists, HyperLogLogs and geo indexes
//! - `events`: append-only event streams with consumer groups and replay
//! - `bus`: dual-transport (stream + priority queue) publish/consume
//! - `substrate`: connects once and builds every component from config

pub mod bus;
pub mod cache;
pub mod clock;
pub mod config;
pub mod consumer;
pub mod data;
pub mod events;
pub mod handler;
pub mod queue;
pub mod store;
pub mod substrate;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use bus::{HybridBroker, Message, MessageDispatcher, MessageHandler, Priority, Transport};
pub use cache::{AggregationCache, CacheCoordinator, CacheKind, DashboardCache, MetricCache, QueryCache};
pub use config::Config;
pub use consumer::{ConsumerHandle, ConsumerOptions};
pub use data::StructuredDataService;
pub use events::{Event, EventLog, EventType, NewEvent};
pub use handler::HandlerError;
pub use substrate::{Substrate, SubstrateError};
