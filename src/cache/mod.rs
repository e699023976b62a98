//! Read-through cache over the key/value store.
//!
//! Entries are keyed by a deterministic logical key derived from a request
//! descriptor and indexed by dependency tags (usually table or collection
//! names) so writes to an authoritative store can drop every dependent entry.
//!
//! This module contains:
//! - `CacheCoordinator`: lookup, compute-on-miss, invalidation
//! - Key derivation (`logical_key`, `dependency_key`, `canonical_json`)
//! - Per-store facades (`QueryCache`, `AggregationCache`, `DashboardCache`,
//!   `MetricCache`)

use std::fmt;

use serde::Deserialize;

use crate::store::StoreError;

pub mod coordinator;
pub mod entry;
pub mod key;
pub mod kinds;

#[cfg(test)]
mod tests;

pub use coordinator::{CacheCoordinator, CacheStats, SingleFlight};
pub use entry::CacheEntry;
pub use key::{canonical_json, dependency_key, logical_key};
pub use kinds::{AggregationCache, DashboardCache, MetricCache, QueryCache};

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors that can occur during cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Cache serialization error: {0}")]
    Serialization(String),

    #[error("Upstream computation failed: {0}")]
    UpstreamCompute(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Cache namespace, one per kind of authoritative store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    /// Relational query results.
    Query,
    /// Document-store aggregation pipelines.
    Aggregation,
    /// Rendered dashboard views.
    Dashboard,
    /// Time-series metric windows.
    Metric,
}

impl CacheKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Aggregation => "aggregation",
            Self::Dashboard => "dashboard",
            Self::Metric => "metric",
        }
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL applied by callers that have no better value.
    pub default_ttl_secs: u64,
    /// Share one computation between concurrent misses for the same key.
    pub single_flight: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 300,
            single_flight: true,
        }
    }
}
