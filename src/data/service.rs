use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use super::{decode, encode, DataKind, Result};
use crate::store::{GeoPosition, GeoUnit, KeyTtl, KeyValueStore};

/// Which end of a list a push goes to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ListEnd {
    Head,
    #[default]
    Tail,
}

/// What `cleanup_expired` may delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CleanupPolicy {
    /// Only report; keys without expiry are intentional and kept.
    #[default]
    KeepPersistent,
    /// Also delete keys that have no expiry set.
    IncludePersistent,
}

/// Outcome of a cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub scanned: u64,
    /// Keys that expired between the scan and the TTL check.
    pub expired: Vec<String>,
    /// Keys with a pending expiry, left for the store to remove.
    pub expiring: u64,
    pub persistent_kept: u64,
    pub persistent_deleted: u64,
}

/// Key and element counts for one data kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindStats {
    pub keys: u64,
    /// Sum of collection sizes (fields, members, entries or estimated cardinality).
    pub elements: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataStats {
    pub kinds: BTreeMap<DataKind, KindStats>,
}

impl DataStats {
    pub fn total_keys(&self) -> u64 {
        self.kinds.values().map(|k| k.keys).sum()
    }
}

/// Namespaced, typed access to hashes, sets, sorted sets, lists,
/// HyperLogLogs and geo indexes.
#[derive(Clone)]
pub struct StructuredDataService {
    store: Arc<dyn KeyValueStore>,
    prefix: String,
}

impl StructuredDataService {
    pub fn new(store: Arc<dyn KeyValueStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Store key for `key` of `kind`: `{prefix}:{kind}:{key}`.
    pub fn namespaced(&self, kind: DataKind, key: &str) -> String {
        format!("{}:{}:{}", self.prefix, kind.segment(), key)
    }

    fn encode_all<T: Serialize>(values: &[T]) -> Result<Vec<String>> {
        values.iter().map(|v| encode(v)).collect()
    }

    // --- hash ---

    /// Returns true if the field is new.
    pub async fn hash_set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        field: &str,
        value: &T,
    ) -> Result<bool> {
        let key = self.namespaced(DataKind::Hash, key);
        Ok(self.store.hset(&key, field, &encode(value)?).await?)
    }

    pub async fn hash_get<T: DeserializeOwned>(&self, key: &str, field: &str) -> Result<Option<T>> {
        let key = self.namespaced(DataKind::Hash, key);
        self.store
            .hget(&key, field)
            .await?
            .map(|raw| decode(&raw))
            .transpose()
    }

    pub async fn hash_get_all<T: DeserializeOwned>(&self, key: &str) -> Result<HashMap<String, T>> {
        let key = self.namespaced(DataKind::Hash, key);
        self.store
            .hgetall(&key)
            .await?
            .into_iter()
            .map(|(field, raw)| Ok((field, decode(&raw)?)))
            .collect()
    }

    pub async fn hash_delete(&self, key: &str, field: &str) -> Result<bool> {
        let key = self.namespaced(DataKind::Hash, key);
        Ok(self.store.hdel(&key, field).await?)
    }

    // --- set ---

    /// Returns the number of members that were not already present.
    pub async fn set_add<T: Serialize>(&self, key: &str, members: &[T]) -> Result<u64> {
        let key = self.namespaced(DataKind::Set, key);
        Ok(self.store.sadd(&key, &Self::encode_all(members)?).await?)
    }

    pub async fn set_remove<T: Serialize>(&self, key: &str, members: &[T]) -> Result<u64> {
        let key = self.namespaced(DataKind::Set, key);
        Ok(self.store.srem(&key, &Self::encode_all(members)?).await?)
    }

    /// Members in encoded order.
    pub async fn set_members<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>> {
        let key = self.namespaced(DataKind::Set, key);
        let mut raw = self.store.smembers(&key).await?;
        raw.sort();
        raw.iter().map(|m| decode(m)).collect()
    }

    pub async fn set_contains<T: Serialize + ?Sized>(&self, key: &str, member: &T) -> Result<bool> {
        let key = self.namespaced(DataKind::Set, key);
        Ok(self.store.sismember(&key, &encode(member)?).await?)
    }

    // --- sorted set ---

    /// Returns true if the member is new.
    pub async fn sorted_set_add<T: Serialize + ?Sized>(
        &self,
        key: &str,
        member: &T,
        score: f64,
    ) -> Result<bool> {
        let key = self.namespaced(DataKind::SortedSet, key);
        Ok(self.store.zadd(&key, &encode(member)?, score).await?)
    }

    /// Rank range, ascending by score.
    pub async fn sorted_set_range<T: DeserializeOwned>(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<(T, f64)>> {
        let key = self.namespaced(DataKind::SortedSet, key);
        let entries = self.store.zrange_withscores(&key, start, stop).await?;
        decode_scored(entries)
    }

    /// Inclusive score range, ascending by score.
    pub async fn sorted_set_range_by_score<T: DeserializeOwned>(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(T, f64)>> {
        let key = self.namespaced(DataKind::SortedSet, key);
        let entries = self.store.zrangebyscore_withscores(&key, min, max).await?;
        decode_scored(entries)
    }

    pub async fn sorted_set_score<T: Serialize + ?Sized>(
        &self,
        key: &str,
        member: &T,
    ) -> Result<Option<f64>> {
        let key = self.namespaced(DataKind::SortedSet, key);
        Ok(self.store.zscore(&key, &encode(member)?).await?)
    }

    pub async fn sorted_set_remove<T: Serialize + ?Sized>(
        &self,
        key: &str,
        member: &T,
    ) -> Result<bool> {
        let key = self.namespaced(DataKind::SortedSet, key);
        Ok(self.store.zrem(&key, &encode(member)?).await?)
    }

    // --- list ---

    /// Push values in order; returns the new length.
    pub async fn list_push<T: Serialize>(
        &self,
        key: &str,
        values: &[T],
        end: ListEnd,
    ) -> Result<u64> {
        let key = self.namespaced(DataKind::List, key);
        let encoded = Self::encode_all(values)?;
        let len = match end {
            ListEnd::Head => self.store.lpush(&key, &encoded).await?,
            ListEnd::Tail => self.store.rpush(&key, &encoded).await?,
        };
        Ok(len)
    }

    pub async fn list_range<T: DeserializeOwned>(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<T>> {
        let key = self.namespaced(DataKind::List, key);
        let raw = self.store.lrange(&key, start, stop).await?;
        raw.iter().map(|v| decode(v)).collect()
    }

    pub async fn list_len(&self, key: &str) -> Result<u64> {
        let key = self.namespaced(DataKind::List, key);
        Ok(self.store.llen(&key).await?)
    }

    /// Keep only the elements in `start..=stop`.
    pub async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        let key = self.namespaced(DataKind::List, key);
        Ok(self.store.ltrim(&key, start, stop).await?)
    }

    // --- HyperLogLog ---

    /// Returns true if the estimated cardinality changed.
    pub async fn hll_add<T: Serialize>(&self, key: &str, elements: &[T]) -> Result<bool> {
        let key = self.namespaced(DataKind::HyperLogLog, key);
        Ok(self.store.pfadd(&key, &Self::encode_all(elements)?).await?)
    }

    pub async fn hll_count(&self, key: &str) -> Result<u64> {
        let key = self.namespaced(DataKind::HyperLogLog, key);
        Ok(self.store.pfcount(&key).await?)
    }

    // --- geo ---

    /// Returns true if the member is new.
    pub async fn geo_add<T: Serialize + ?Sized>(
        &self,
        key: &str,
        member: &T,
        position: GeoPosition,
    ) -> Result<bool> {
        let key = self.namespaced(DataKind::Geo, key);
        Ok(self.store.geoadd(&key, position, &encode(member)?).await?)
    }

    pub async fn geo_distance<T: Serialize + ?Sized>(
        &self,
        key: &str,
        a: &T,
        b: &T,
        unit: GeoUnit,
    ) -> Result<Option<f64>> {
        let key = self.namespaced(DataKind::Geo, key);
        Ok(self
            .store
            .geodist(&key, &encode(a)?, &encode(b)?, unit)
            .await?)
    }

    pub async fn geo_position<T: Serialize + ?Sized>(
        &self,
        key: &str,
        member: &T,
    ) -> Result<Option<GeoPosition>> {
        let key = self.namespaced(DataKind::Geo, key);
        Ok(self.store.geopos(&key, &encode(member)?).await?)
    }

    /// Members within `radius` of `center`, nearest first, with their distance.
    pub async fn geo_radius<T: DeserializeOwned>(
        &self,
        key: &str,
        center: GeoPosition,
        radius: f64,
        unit: GeoUnit,
    ) -> Result<Vec<(T, f64)>> {
        let key = self.namespaced(DataKind::Geo, key);
        let found = self.store.georadius(&key, center, radius, unit).await?;
        decode_scored(found)
    }

    // --- key lifecycle ---

    /// Returns false if the key does not exist.
    pub async fn expire(&self, kind: DataKind, key: &str, seconds: u64) -> Result<bool> {
        Ok(self
            .store
            .expire(&self.namespaced(kind, key), seconds)
            .await?)
    }

    pub async fn delete(&self, kind: DataKind, key: &str) -> Result<bool> {
        let removed = self.store.delete(&[self.namespaced(kind, key)]).await?;
        Ok(removed > 0)
    }

    // --- maintenance ---

    /// Key and element counts per data kind under this prefix.
    pub async fn get_stats(&self) -> Result<DataStats> {
        let mut stats = DataStats::default();
        for kind in DataKind::ALL {
            let pattern = format!("{}:{}:*", self.prefix, kind.segment());
            let keys = self.store.scan(&pattern).await?;

            let mut kind_stats = KindStats::default();
            for key in keys {
                let elements = match kind {
                    DataKind::Hash => self.store.hlen(&key).await?,
                    DataKind::Set => self.store.scard(&key).await?,
                    DataKind::SortedSet | DataKind::Geo => self.store.zcard(&key).await?,
                    DataKind::List => self.store.llen(&key).await?,
                    DataKind::HyperLogLog => self.store.pfcount(&key).await?,
                };
                kind_stats.keys += 1;
                kind_stats.elements += elements;
            }
            stats.kinds.insert(kind, kind_stats);
        }
        debug!(prefix = %self.prefix, total_keys = stats.total_keys(), "Collected data stats");
        Ok(stats)
    }

    /// Walk every key under this prefix and classify it by expiry state.
    ///
    /// Keys that already expired are only reported. Keys without expiry are
    /// deleted only under [`CleanupPolicy::IncludePersistent`].
    pub async fn cleanup_expired(&self, policy: CleanupPolicy) -> Result<CleanupReport> {
        let keys = self.store.scan(&format!("{}:*", self.prefix)).await?;
        let mut report = CleanupReport::default();

        let mut doomed = Vec::new();
        for key in keys {
            report.scanned += 1;
            match self.store.ttl(&key).await? {
                KeyTtl::Missing => report.expired.push(key),
                KeyTtl::Remaining(_) => report.expiring += 1,
                KeyTtl::Persistent => match policy {
                    CleanupPolicy::KeepPersistent => report.persistent_kept += 1,
                    CleanupPolicy::IncludePersistent => doomed.push(key),
                },
            }
        }

        if !doomed.is_empty() {
            report.persistent_deleted = self.store.delete(&doomed).await?;
        }

        info!(
            prefix = %self.prefix,
            scanned = report.scanned,
            expired = report.expired.len(),
            persistent_deleted = report.persistent_deleted,
            "Cleanup pass finished"
        );
        Ok(report)
    }
}

fn decode_scored<T: DeserializeOwned>(entries: Vec<(String, f64)>) -> Result<Vec<(T, f64)>> {
    entries
        .into_iter()
        .map(|(member, score)| Ok((decode(&member)?, score)))
        .collect()
}
