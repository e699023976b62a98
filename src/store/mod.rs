//! Key/value store adapter.
//!
//! This module contains:
//! - `KeyValueStore` trait: the only way higher layers talk to the store
//! - Store value types (`KeyTtl`, `StreamEntry`, `ReadCursor`, geo types)
//! - Store configuration and the `init_store` factory
//! - Implementations: Redis, in-memory
//!
//! The adapter never retries. Retry and degradation policy belong to callers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::clock::Clock;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

// ============================================================================
// Errors
// ============================================================================

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store connection failed: {0}")]
    Connection(String),

    #[error("Consumer group '{group}' already exists on '{stream}'")]
    GroupExists { stream: String, group: String },

    #[error("Store command failed: {0}")]
    Command(String),

    #[error("Unexpected store reply: {0}")]
    Conversion(String),
}

impl StoreError {
    /// True when the failure is a lost or refused connection.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

// ============================================================================
// Value types
// ============================================================================

/// Typed reply of the store's TTL query.
///
/// The store answers `-1` for keys without expiry and `-2` for keys that do not
/// exist (never written, deleted, or already expired). Keeping those apart is
/// what lets cleanup treat persistent keys as intentional.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// Seconds until expiry.
    Remaining(u64),
    /// Key exists and has no expiry set.
    Persistent,
    /// Key does not exist (or has expired).
    Missing,
}

impl KeyTtl {
    /// Map the raw `TTL` reply.
    pub fn from_reply(reply: i64) -> Self {
        match reply {
            -1 => Self::Persistent,
            n if n < 0 => Self::Missing,
            n => Self::Remaining(n as u64),
        }
    }
}

/// Distance unit for geo queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GeoUnit {
    Meters,
    #[default]
    Kilometers,
    Miles,
    Feet,
}

impl GeoUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Meters => "m",
            Self::Kilometers => "km",
            Self::Miles => "mi",
            Self::Feet => "ft",
        }
    }

    /// Number of meters in one unit.
    pub fn meters(&self) -> f64 {
        match self {
            Self::Meters => 1.0,
            Self::Kilometers => 1000.0,
            Self::Miles => 1609.34,
            Self::Feet => 0.3048,
        }
    }
}

/// Longitude/latitude pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPosition {
    pub longitude: f64,
    pub latitude: f64,
}

/// One record of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Store-assigned entry id (`{ms}-{seq}`).
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Where a consumer-group read starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadCursor {
    /// Entries already delivered to this consumer but not acknowledged,
    /// with ids strictly greater than `after`.
    Pending { after: String },
    /// Entries never delivered to the group.
    New,
}

impl ReadCursor {
    /// This consumer's whole pending list.
    pub fn pending() -> Self {
        Self::Pending {
            after: "0".to_string(),
        }
    }

    pub fn pending_after(id: impl Into<String>) -> Self {
        Self::Pending { after: id.into() }
    }

    pub fn as_id(&self) -> &str {
        match self {
            Self::Pending { after } => after,
            Self::New => ">",
        }
    }
}

/// Start id of a claim sweep, and the id a finished sweep hands back.
pub const CLAIM_START: &str = "0-0";

/// Reply of a claim sweep over a group's pending list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamClaim {
    /// Where the next sweep continues; [`CLAIM_START`] once the list is covered.
    pub next: String,
    /// Entries now owned by the claiming consumer. A trimmed entry comes back
    /// with no fields.
    pub entries: Vec<StreamEntry>,
    /// Pending ids whose entry no longer exists; the store dropped them.
    pub deleted: Vec<String>,
}

/// Parse a stream id (`{ms}-{seq}` or bare `{ms}`) into an ordered pair.
pub fn parse_stream_id(id: &str) -> Option<(u64, u64)> {
    match id.split_once('-') {
        Some((ms, seq)) => Some((ms.parse().ok()?, seq.parse().ok()?)),
        None => Some((id.parse().ok()?, 0)),
    }
}

// ============================================================================
// Trait
// ============================================================================

/// Interface to the shared key/value store.
///
/// Implementations:
/// - `RedisStore`: Redis via a multiplexed `ConnectionManager`
/// - `MemoryStore`: in-process store for standalone mode and tests
///
/// Every call is an independent atomic operation; no multi-key transactions.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    // --- keys ---
    async fn ping(&self) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    /// Delete keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn expire(&self, key: &str, seconds: u64) -> Result<bool>;
    async fn ttl(&self, key: &str) -> Result<KeyTtl>;
    /// Enumerate keys matching a glob pattern (cursor based, non-blocking).
    async fn scan(&self, pattern: &str) -> Result<Vec<String>>;

    // --- hash ---
    /// Returns true if the field was newly created.
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<bool>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;
    async fn hdel(&self, key: &str, field: &str) -> Result<bool>;
    async fn hlen(&self, key: &str) -> Result<u64>;

    // --- set ---
    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64>;
    async fn srem(&self, key: &str, members: &[String]) -> Result<u64>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;
    async fn sismember(&self, key: &str, member: &str) -> Result<bool>;
    async fn scard(&self, key: &str) -> Result<u64>;

    // --- sorted set ---
    /// Returns true if the member was newly added.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool>;
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>>;
    /// Rank range, ascending by score then member. Negative indices count from the end.
    async fn zrange_withscores(&self, key: &str, start: i64, stop: i64)
        -> Result<Vec<(String, f64)>>;
    async fn zrangebyscore_withscores(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>>;
    async fn zcard(&self, key: &str) -> Result<u64>;

    // --- list ---
    async fn lpush(&self, key: &str, values: &[String]) -> Result<u64>;
    async fn rpush(&self, key: &str, values: &[String]) -> Result<u64>;
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;
    async fn llen(&self, key: &str) -> Result<u64>;
    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()>;

    // --- HyperLogLog ---
    /// Returns true if the estimated cardinality changed.
    async fn pfadd(&self, key: &str, elements: &[String]) -> Result<bool>;
    async fn pfcount(&self, key: &str) -> Result<u64>;

    // --- geo ---
    async fn geoadd(&self, key: &str, position: GeoPosition, member: &str) -> Result<bool>;
    async fn geopos(&self, key: &str, member: &str) -> Result<Option<GeoPosition>>;
    async fn geodist(&self, key: &str, a: &str, b: &str, unit: GeoUnit) -> Result<Option<f64>>;
    /// Members within `radius` of `center`, nearest first.
    async fn georadius(
        &self,
        key: &str,
        center: GeoPosition,
        radius: f64,
        unit: GeoUnit,
    ) -> Result<Vec<(String, f64)>>;

    // --- stream ---
    /// Append an entry, returning the store-assigned id.
    async fn xadd(&self, key: &str, fields: &[(String, String)]) -> Result<String>;
    /// Create a consumer group (creating the stream if needed).
    ///
    /// Fails with `StoreError::GroupExists` if the group is already there.
    async fn xgroup_create(&self, key: &str, group: &str, start_id: &str) -> Result<()>;
    async fn xreadgroup(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>>;
    async fn xack(&self, key: &str, group: &str, ids: &[String]) -> Result<u64>;
    /// Transfer pending entries idle for at least `min_idle` to `consumer`,
    /// scanning the group's pending list from `start`.
    async fn xautoclaim(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        start: &str,
        count: usize,
    ) -> Result<StreamClaim>;
    /// Inclusive id range; `-` and `+` denote the stream ends.
    async fn xrange(
        &self,
        key: &str,
        start: &str,
        end: &str,
        count: Option<usize>,
    ) -> Result<Vec<StreamEntry>>;
    async fn xlen(&self, key: &str) -> Result<u64>;
    /// Number of delivered-but-unacknowledged entries for a group.
    async fn xpending_count(&self, key: &str, group: &str) -> Result<u64>;
}

// ============================================================================
// Configuration
// ============================================================================

/// Store type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    /// Redis server.
    #[default]
    Redis,
    /// In-process store (standalone/dev).
    Memory,
}

/// Store configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store type discriminator.
    #[serde(rename = "type")]
    pub store_type: StoreType,
    /// Redis-specific configuration.
    pub redis: RedisStoreConfig,
}

/// Redis-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisStoreConfig {
    /// Redis connection URL.
    pub url: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize the store based on configuration.
///
/// Requires the corresponding feature for networked stores:
/// - Redis: `--features redis` (included in default)
pub async fn init_store(config: &StoreConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn KeyValueStore>> {
    match config.store_type {
        StoreType::Redis => {
            #[cfg(feature = "redis")]
            {
                let _ = clock;
                let store = RedisStore::connect(&config.redis.url).await?;
                info!(store_type = "redis", "Store initialized");
                Ok(Arc::new(store))
            }

            #[cfg(not(feature = "redis"))]
            {
                let _ = clock;
                Err(StoreError::Connection(
                    "Redis support requires the 'redis' feature. Rebuild with --features redis"
                        .to_string(),
                ))
            }
        }
        StoreType::Memory => {
            info!(store_type = "memory", "Store initialized");
            Ok(Arc::new(MemoryStore::with_clock(clock)))
        }
    }
}
