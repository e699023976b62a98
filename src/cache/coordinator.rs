//! Read-through cache coordination.

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::entry::CacheEntry;
use super::key::{dependency_key, logical_key};
use super::{CacheError, CacheKind, Result};
use crate::clock::Clock;
use crate::store::KeyValueStore;

/// Per-key gates that let concurrent misses share one computation.
///
/// Only coordinates callers inside this process. Two processes missing the
/// same key at once both compute and the last write wins.
#[derive(Clone, Default)]
pub struct SingleFlight {
    gates: Arc<DashMap<String, Gate>>,
}

/// A per-key lock and the number of callers holding a share of it.
struct Gate {
    lock: Arc<Mutex<()>>,
    holders: usize,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the gate for `key`, creating it if no caller holds one.
    fn join(&self, key: &str) -> Flight {
        let mut gate = self.gates.entry(key.to_string()).or_insert_with(|| Gate {
            lock: Arc::new(Mutex::new(())),
            holders: 0,
        });
        gate.holders += 1;
        Flight {
            gates: self.gates.clone(),
            key: key.to_string(),
            lock: gate.lock.clone(),
        }
    }

    /// Number of keys with a computation in progress.
    pub fn in_flight(&self) -> usize {
        self.gates.len()
    }
}

/// One caller's share of a gate. Dropping it, on completion or
/// cancellation, removes the gate once no other caller holds it.
struct Flight {
    gates: Arc<DashMap<String, Gate>>,
    key: String,
    lock: Arc<Mutex<()>>,
}

impl Drop for Flight {
    fn drop(&mut self) {
        if let Entry::Occupied(mut gate) = self.gates.entry(self.key.clone()) {
            gate.get_mut().holders -= 1;
            if gate.get().holders == 0 {
                gate.remove();
            }
        }
    }
}

/// Snapshot of a coordinator's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stale_evictions: u64,
    pub computations: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    stale_evictions: AtomicU64,
    computations: AtomicU64,
}

/// Read-through cache for one cache kind.
pub struct CacheCoordinator {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    kind: CacheKind,
    default_ttl_secs: u64,
    single_flight: Option<SingleFlight>,
    counters: Counters,
}

impl CacheCoordinator {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, kind: CacheKind) -> Self {
        Self {
            store,
            clock,
            kind,
            default_ttl_secs: 300,
            single_flight: Some(SingleFlight::new()),
            counters: Counters::default(),
        }
    }

    /// Share `gates` with other coordinators, or disable single-flight with `None`.
    pub fn with_single_flight(mut self, gates: Option<SingleFlight>) -> Self {
        self.single_flight = gates;
        self
    }

    pub fn with_default_ttl(mut self, seconds: u64) -> Self {
        self.default_ttl_secs = seconds;
        self
    }

    pub fn kind(&self) -> CacheKind {
        self.kind
    }

    pub fn default_ttl(&self) -> u64 {
        self.default_ttl_secs
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Return the cached payload for `descriptor`, computing and caching it on a miss.
    ///
    /// The key is added to the dependency index of every tag in `tags`. A
    /// `ttl_seconds` of zero computes without caching.
    pub async fn cached_compute<D, T, F, Fut, E>(
        &self,
        descriptor: &D,
        ttl_seconds: u64,
        compute: F,
        tags: &[&str],
    ) -> Result<T>
    where
        D: Serialize + ?Sized,
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        let key = logical_key(self.kind, descriptor)?;

        if let Some(hit) = self.lookup(&key).await? {
            return Ok(hit);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let Some(flights) = &self.single_flight else {
            return self.compute_and_store(&key, ttl_seconds, compute, tags).await;
        };

        let flight = flights.join(&key);
        let _lock = flight.lock.lock().await;
        // Another caller may have filled the entry while we waited.
        match self.lookup(&key).await? {
            Some(hit) => Ok(hit),
            None => self.compute_and_store(&key, ttl_seconds, compute, tags).await,
        }
    }

    /// Remove the entry for `descriptor`. Returns whether one existed.
    pub async fn invalidate<D: Serialize + ?Sized>(&self, descriptor: &D) -> Result<bool> {
        let key = logical_key(self.kind, descriptor)?;
        let removed = self.store.delete(&[key.clone()]).await?;
        debug!(key = %key, removed = removed > 0, "Invalidated cache entry");
        Ok(removed > 0)
    }

    /// Remove every entry indexed under `tag` along with the index itself.
    ///
    /// Returns the number of cache entries removed.
    pub async fn invalidate_by_tag(&self, tag: &str) -> Result<u64> {
        let index = dependency_key(self.kind, tag);
        let members = self.store.smembers(&index).await?;

        let removed = if members.is_empty() {
            0
        } else {
            self.store.delete(&members).await?
        };
        self.store.delete(&[index.clone()]).await?;

        debug!(index = %index, removed = removed, "Invalidated cache entries by tag");
        Ok(removed)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            stale_evictions: self.counters.stale_evictions.load(Ordering::Relaxed),
            computations: self.counters.computations.load(Ordering::Relaxed),
        }
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };

        let entry: CacheEntry = serde_json::from_str(&raw)
            .map_err(|e| CacheError::Serialization(format!("Corrupted entry '{}': {}", key, e)))?;

        if !entry.is_fresh(self.clock.now_epoch_ms()) {
            self.store.delete(&[key.to_string()]).await?;
            self.counters.stale_evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Evicted stale cache entry");
            return Ok(None);
        }

        let payload = serde_json::from_value(entry.payload)
            .map_err(|e| CacheError::Serialization(format!("Corrupted payload '{}': {}", key, e)))?;
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "Cache hit");
        Ok(Some(payload))
    }

    async fn compute_and_store<T, F, Fut, E>(
        &self,
        key: &str,
        ttl_seconds: u64,
        compute: F,
        tags: &[&str],
    ) -> Result<T>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        self.counters.computations.fetch_add(1, Ordering::Relaxed);
        let payload = compute().await.map_err(|e| {
            warn!(key = %key, error = %e, "Upstream computation failed");
            CacheError::UpstreamCompute(e.to_string())
        })?;

        if ttl_seconds == 0 {
            return Ok(payload);
        }

        let entry = CacheEntry {
            logical_key: key.to_string(),
            payload: serde_json::to_value(&payload)?,
            cached_at_epoch_ms: self.clock.now_epoch_ms(),
            ttl_seconds,
        };
        let raw = serde_json::to_string(&entry)?;
        self.store
            .set(key, &raw, Some(Duration::from_secs(ttl_seconds)))
            .await?;

        let member = [key.to_string()];
        for tag in tags {
            self.store
                .sadd(&dependency_key(self.kind, tag), &member)
                .await?;
        }

        debug!(key = %key, ttl_seconds = ttl_seconds, tags = tags.len(), "Cached computed payload");
        Ok(payload)
    }
}
