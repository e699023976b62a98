//! Redis `KeyValueStore` implementation.
//!
//! All calls go through a multiplexed `ConnectionManager`, cloned per call.
//! The manager reconnects on its own; a command issued while the link is down
//! fails with `StoreError::Connection` and is not retried here.

use std::collections::HashMap;
use std::time::Duration;

use ::redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamPendingReply, StreamRangeReply,
    StreamReadOptions, StreamReadReply,
};
use ::redis::{aio::ConnectionManager, AsyncCommands, Client, RedisError};
use async_trait::async_trait;
use tracing::{debug, info};

use super::{
    GeoPosition, GeoUnit, KeyTtl, KeyValueStore, ReadCursor, Result, StoreError, StreamClaim,
    StreamEntry,
};

/// SCAN page size hint.
const SCAN_COUNT: usize = 500;

impl From<RedisError> for StoreError {
    fn from(e: RedisError) -> Self {
        if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout()
        {
            StoreError::Connection(e.to_string())
        } else if e.kind() == ::redis::ErrorKind::TypeError {
            StoreError::Conversion(e.to_string())
        } else {
            StoreError::Command(e.to_string())
        }
    }
}

fn to_entry(id: StreamId) -> StreamEntry {
    let fields = id
        .map
        .iter()
        .filter_map(|(k, v)| {
            ::redis::from_redis_value::<String>(v)
                .ok()
                .map(|s| (k.clone(), s))
        })
        .collect();
    StreamEntry { id: id.id, fields }
}

/// Redis-backed store.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., redis://localhost:6379)
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        info!(url = %url, "Connected to Redis");

        Ok(Self { conn })
    }

    /// Wrap an existing connection manager.
    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        debug!(key = %key, "SET");
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        Ok(conn.del(keys).await?)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(::redis::cmd("EXPIRE")
            .arg(key)
            .arg(seconds)
            .query_async(&mut conn)
            .await?)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let mut conn = self.conn.clone();
        let reply: i64 = ::redis::cmd("TTL").arg(key).query_async(&mut conn).await?;
        Ok(KeyTtl::from_reply(reply))
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, page): (u64, Vec<String>) = ::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(page);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let added: u64 = conn.hset(key, field, value).await?;
        Ok(added > 0)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, field).await?)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(key).await?)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.hdel(key, field).await?;
        Ok(removed > 0)
    }

    async fn hlen(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.hlen(key).await?)
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        Ok(conn.sadd(key, members).await?)
    }

    async fn srem(&self, key: &str, members: &[String]) -> Result<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        Ok(conn.srem(key, members).await?)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut members: Vec<String> = conn.smembers(key).await?;
        members.sort();
        Ok(members)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.sismember(key, member).await?)
    }

    async fn scard(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.scard(key).await?)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let added: u64 = conn.zadd(key, member, score).await?;
        Ok(added > 0)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.zrem(key, member).await?;
        Ok(removed > 0)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let mut conn = self.conn.clone();
        Ok(conn.zscore(key, member).await?)
    }

    async fn zrange_withscores(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<(String, f64)>> {
        let mut conn = self.conn.clone();
        Ok(conn
            .zrange_withscores(key, start as isize, stop as isize)
            .await?)
    }

    async fn zrangebyscore_withscores(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>> {
        let mut conn = self.conn.clone();
        Ok(conn.zrangebyscore_withscores(key, min, max).await?)
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.zcard(key).await?)
    }

    async fn lpush(&self, key: &str, values: &[String]) -> Result<u64> {
        let mut conn = self.conn.clone();
        if values.is_empty() {
            return Ok(conn.llen(key).await?);
        }
        Ok(conn.lpush(key, values).await?)
    }

    async fn rpush(&self, key: &str, values: &[String]) -> Result<u64> {
        let mut conn = self.conn.clone();
        if values.is_empty() {
            return Ok(conn.llen(key).await?);
        }
        Ok(conn.rpush(key, values).await?)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.lrange(key, start as isize, stop as isize).await?)
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(key).await?)
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.ltrim(key, start as isize, stop as isize).await?;
        Ok(())
    }

    async fn pfadd(&self, key: &str, elements: &[String]) -> Result<bool> {
        let mut conn = self.conn.clone();
        let changed: u64 = ::redis::cmd("PFADD")
            .arg(key)
            .arg(elements)
            .query_async(&mut conn)
            .await?;
        Ok(changed > 0)
    }

    async fn pfcount(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        Ok(::redis::cmd("PFCOUNT")
            .arg(key)
            .query_async(&mut conn)
            .await?)
    }

    async fn geoadd(&self, key: &str, position: GeoPosition, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let added: u64 = ::redis::cmd("GEOADD")
            .arg(key)
            .arg(position.longitude)
            .arg(position.latitude)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(added > 0)
    }

    async fn geopos(&self, key: &str, member: &str) -> Result<Option<GeoPosition>> {
        let mut conn = self.conn.clone();
        let reply: Vec<Option<(f64, f64)>> = ::redis::cmd("GEOPOS")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(reply
            .into_iter()
            .next()
            .flatten()
            .map(|(longitude, latitude)| GeoPosition {
                longitude,
                latitude,
            }))
    }

    async fn geodist(&self, key: &str, a: &str, b: &str, unit: GeoUnit) -> Result<Option<f64>> {
        let mut conn = self.conn.clone();
        Ok(::redis::cmd("GEODIST")
            .arg(key)
            .arg(a)
            .arg(b)
            .arg(unit.as_str())
            .query_async(&mut conn)
            .await?)
    }

    async fn georadius(
        &self,
        key: &str,
        center: GeoPosition,
        radius: f64,
        unit: GeoUnit,
    ) -> Result<Vec<(String, f64)>> {
        let mut conn = self.conn.clone();
        Ok(::redis::cmd("GEOSEARCH")
            .arg(key)
            .arg("FROMLONLAT")
            .arg(center.longitude)
            .arg(center.latitude)
            .arg("BYRADIUS")
            .arg(radius)
            .arg(unit.as_str())
            .arg("ASC")
            .arg("WITHDIST")
            .query_async(&mut conn)
            .await?)
    }

    async fn xadd(&self, key: &str, fields: &[(String, String)]) -> Result<String> {
        let mut conn = self.conn.clone();
        let mut cmd = ::redis::cmd("XADD");
        cmd.arg(key).arg("*");
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        let id: String = cmd.query_async(&mut conn).await?;
        debug!(stream = %key, id = %id, "XADD");
        Ok(id)
    }

    async fn xgroup_create(&self, key: &str, group: &str, start_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let result: std::result::Result<(), RedisError> = ::redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(key)
            .arg(group)
            .arg(start_id)
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Err(StoreError::GroupExists {
                stream: key.to_string(),
                group: group.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn xreadgroup(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let mut opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count.max(1));
        if let Some(block) = block {
            opts = opts.block(block.as_millis() as usize);
        }

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[key], &[cursor.as_id()], &opts)
            .await?;

        Ok(reply
            .map(|r| {
                r.keys
                    .into_iter()
                    .flat_map(|k| k.ids)
                    // Pending entries whose payload was trimmed come back empty.
                    .map(to_entry)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn xack(&self, key: &str, group: &str, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        Ok(conn.xack(key, group, ids).await?)
    }

    async fn xautoclaim(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        start: &str,
        count: usize,
    ) -> Result<StreamClaim> {
        let mut conn = self.conn.clone();
        let opts = StreamAutoClaimOptions::default().count(count.max(1));
        let reply: StreamAutoClaimReply = conn
            .xautoclaim_options(
                key,
                group,
                consumer,
                min_idle.as_millis() as u64,
                start,
                opts,
            )
            .await?;
        Ok(StreamClaim {
            next: reply.next_stream_id,
            entries: reply.claimed.into_iter().map(to_entry).collect(),
            deleted: reply.deleted_ids,
        })
    }

    async fn xrange(
        &self,
        key: &str,
        start: &str,
        end: &str,
        count: Option<usize>,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = match count {
            Some(count) => conn.xrange_count(key, start, end, count).await?,
            None => conn.xrange(key, start, end).await?,
        };
        Ok(reply.ids.into_iter().map(to_entry).collect())
    }

    async fn xlen(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.xlen(key).await?)
    }

    async fn xpending_count(&self, key: &str, group: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingReply = conn.xpending(key, group).await?;
        Ok(reply.count() as u64)
    }
}
