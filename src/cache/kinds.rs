//! Per-store cache facades.
//!
//! Each facade fixes the descriptor shape and the dependency tags for one
//! kind of authoritative store, so callers only supply the request and the
//! function that answers it.

use std::fmt::Display;
use std::future::Future;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::coordinator::CacheCoordinator;
use super::{CacheKind, Result};

#[derive(Serialize)]
struct QueryDescriptor<'a> {
    sql: &'a str,
    params: &'a [Value],
}

#[derive(Serialize)]
struct AggregationDescriptor<'a, P: ?Sized> {
    collection: &'a str,
    pipeline: &'a P,
}

#[derive(Serialize)]
struct DashboardDescriptor<'a, Q: ?Sized> {
    dashboard: &'a str,
    filters: &'a Q,
}

#[derive(Serialize)]
struct MetricDescriptor<'a, W: ?Sized> {
    metric: &'a str,
    window: &'a W,
}

/// Relational query results, tagged by the tables a query reads.
pub struct QueryCache {
    coordinator: CacheCoordinator,
}

impl QueryCache {
    pub fn new(coordinator: CacheCoordinator) -> Self {
        debug_assert_eq!(coordinator.kind(), CacheKind::Query);
        Self { coordinator }
    }

    pub async fn cached_query<T, F, Fut, E>(
        &self,
        sql: &str,
        params: &[Value],
        ttl_seconds: u64,
        compute: F,
        tables: &[&str],
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        let descriptor = QueryDescriptor { sql, params };
        self.coordinator
            .cached_compute(&descriptor, ttl_seconds, compute, tables)
            .await
    }

    pub async fn invalidate_query(&self, sql: &str, params: &[Value]) -> Result<bool> {
        self.coordinator
            .invalidate(&QueryDescriptor { sql, params })
            .await
    }

    /// Drop every cached query that read `table`.
    pub async fn invalidate_table(&self, table: &str) -> Result<u64> {
        self.coordinator.invalidate_by_tag(table).await
    }

    pub fn coordinator(&self) -> &CacheCoordinator {
        &self.coordinator
    }
}

/// Document-store aggregation pipelines, tagged by collection.
pub struct AggregationCache {
    coordinator: CacheCoordinator,
}

impl AggregationCache {
    pub fn new(coordinator: CacheCoordinator) -> Self {
        debug_assert_eq!(coordinator.kind(), CacheKind::Aggregation);
        Self { coordinator }
    }

    pub async fn cached_aggregate<P, T, F, Fut, E>(
        &self,
        collection: &str,
        pipeline: &P,
        ttl_seconds: u64,
        compute: F,
    ) -> Result<T>
    where
        P: Serialize + ?Sized,
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        let descriptor = AggregationDescriptor {
            collection,
            pipeline,
        };
        self.coordinator
            .cached_compute(&descriptor, ttl_seconds, compute, &[collection])
            .await
    }

    pub async fn invalidate_collection(&self, collection: &str) -> Result<u64> {
        self.coordinator.invalidate_by_tag(collection).await
    }

    pub fn coordinator(&self) -> &CacheCoordinator {
        &self.coordinator
    }
}

/// Rendered dashboard views, tagged by dashboard id.
pub struct DashboardCache {
    coordinator: CacheCoordinator,
}

impl DashboardCache {
    pub fn new(coordinator: CacheCoordinator) -> Self {
        debug_assert_eq!(coordinator.kind(), CacheKind::Dashboard);
        Self { coordinator }
    }

    pub async fn cached_view<Q, T, F, Fut, E>(
        &self,
        dashboard: &str,
        filters: &Q,
        ttl_seconds: u64,
        compute: F,
    ) -> Result<T>
    where
        Q: Serialize + ?Sized,
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        let descriptor = DashboardDescriptor { dashboard, filters };
        self.coordinator
            .cached_compute(&descriptor, ttl_seconds, compute, &[dashboard])
            .await
    }

    /// Drop every cached view of `dashboard`, whatever its filters.
    pub async fn invalidate_dashboard(&self, dashboard: &str) -> Result<u64> {
        self.coordinator.invalidate_by_tag(dashboard).await
    }

    pub fn coordinator(&self) -> &CacheCoordinator {
        &self.coordinator
    }
}

/// Time-series metric windows, tagged by metric name.
pub struct MetricCache {
    coordinator: CacheCoordinator,
}

impl MetricCache {
    pub fn new(coordinator: CacheCoordinator) -> Self {
        debug_assert_eq!(coordinator.kind(), CacheKind::Metric);
        Self { coordinator }
    }

    pub async fn cached_series<W, T, F, Fut, E>(
        &self,
        metric: &str,
        window: &W,
        ttl_seconds: u64,
        compute: F,
    ) -> Result<T>
    where
        W: Serialize + ?Sized,
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        let descriptor = MetricDescriptor { metric, window };
        self.coordinator
            .cached_compute(&descriptor, ttl_seconds, compute, &[metric])
            .await
    }

    pub async fn invalidate_metric(&self, metric: &str) -> Result<u64> {
        self.coordinator.invalidate_by_tag(metric).await
    }

    pub fn coordinator(&self) -> &CacheCoordinator {
        &self.coordinator
    }
}
