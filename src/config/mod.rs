//! Configuration types and loading.
//!
//! Every section has defaults, so an empty file (or none at all) yields a
//! config that talks to Redis and RabbitMQ on localhost.

use std::time::Duration;

use serde::Deserialize;

use crate::cache::CacheConfig;
use crate::consumer::ConsumerOptions;
use crate::queue::QueueConfig;
use crate::store::StoreConfig;

/// Default config file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "CACHEBUS_CONFIG";
/// Environment variable prefix for configuration overrides.
pub const CONFIG_ENV_PREFIX: &str = "CACHEBUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "CACHEBUS_LOG";

/// Main configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub store: StoreConfig,
    pub queue: QueueConfig,
    pub namespaces: NamespaceConfig,
    pub consumer: ConsumerConfig,
    pub cache: CacheConfig,
}

/// Identity of the running service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Used as message `source` and as the durable queue name prefix.
    pub name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "cachebus".to_string(),
        }
    }
}

/// Key prefixes for each component.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    pub events: String,
    pub messages: String,
    pub data: String,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            events: "events".to_string(),
            messages: "messages".to_string(),
            data: "data".to_string(),
        }
    }
}

/// Consumer-group loop settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Consumer group name; stable per role.
    pub group: String,
    /// Consumer name within the group. Defaults to `{group}-{pid}`.
    pub name: Option<String>,
    pub batch_size: usize,
    /// Server-side block for new entries; 0 disables blocking.
    pub block_ms: u64,
    pub idle_backoff_ms: u64,
    pub error_backoff_ms: u64,
    /// Idle time after which entries pending on another consumer, such as a
    /// previous instance of this process, are claimed; 0 disables claiming.
    pub claim_idle_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group: "cachebus".to_string(),
            name: None,
            batch_size: 10,
            block_ms: 1000,
            idle_backoff_ms: 100,
            error_backoff_ms: 5000,
            claim_idle_ms: 30_000,
        }
    }
}

impl ConsumerConfig {
    pub fn to_options(&self) -> ConsumerOptions {
        let block = (self.block_ms > 0).then(|| Duration::from_millis(self.block_ms));
        let claim_idle =
            (self.claim_idle_ms > 0).then(|| Duration::from_millis(self.claim_idle_ms));
        let options = ConsumerOptions::new(self.group.clone())
            .with_batch_size(self.batch_size)
            .with_block(block)
            .with_backoff(
                Duration::from_millis(self.idle_backoff_ms),
                Duration::from_millis(self.error_backoff_ms),
            )
            .with_claim_idle(claim_idle);
        match &self.name {
            Some(name) => options.with_consumer(name.clone()),
            None => options,
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CACHEBUS_CONFIG` environment variable (if set)
    /// 4. Environment variables with `CACHEBUS__` prefix, `__` between levels
    pub fn load(path: Option<&str>) -> Result<Self, ::config::ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// In-process backends and no external services.
    pub fn for_test() -> Self {
        let mut config = Self::default();
        config.store.store_type = crate::store::StoreType::Memory;
        config.queue.queue_type = crate::queue::QueueType::Memory;
        config
    }
}
