//! In-memory `KeyValueStore` for standalone mode and testing.
//!
//! Mirrors the store semantics the substrate relies on: per-key TTL measured
//! against an injectable clock, score-then-member ordering for sorted sets,
//! consumer groups with a pending-entries list, and empty collections
//! disappearing. HyperLogLog counts are exact. Blocking reads return
//! immediately.

mod stream;

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use self::stream::StreamLog;
use super::{
    GeoPosition, GeoUnit, KeyTtl, KeyValueStore, ReadCursor, Result, StoreError, StreamClaim,
    StreamEntry,
};
use crate::clock::{system_clock, Clock};

/// Mean Earth radius used by the store's geo commands, in meters.
const EARTH_RADIUS_M: f64 = 6_372_797.560_856;

#[derive(Debug)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(BTreeSet<String>),
    ZSet(HashMap<String, f64>),
    List(VecDeque<String>),
    Hll(BTreeSet<String>),
    Geo(HashMap<String, GeoPosition>),
    Stream(StreamLog),
}

impl Value {
    fn is_empty(&self) -> bool {
        match self {
            Value::Str(_) | Value::Stream(_) => false,
            Value::Hash(h) => h.is_empty(),
            Value::Set(s) | Value::Hll(s) => s.is_empty(),
            Value::ZSet(z) => z.is_empty(),
            Value::List(l) => l.is_empty(),
            Value::Geo(g) => g.is_empty(),
        }
    }
}

#[derive(Debug)]
struct Slot {
    value: Value,
    expires_at_ms: Option<i64>,
}

#[derive(Debug, Default)]
struct Keyspace {
    slots: HashMap<String, Slot>,
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Command(format!(
        "WRONGTYPE Operation against a key holding the wrong kind of value: {}",
        key
    ))
}

impl Keyspace {
    /// Drop the key if its TTL has passed.
    fn purge_if_expired(&mut self, key: &str, now: i64) {
        let expired = self
            .slots
            .get(key)
            .and_then(|s| s.expires_at_ms)
            .is_some_and(|at| at <= now);
        if expired {
            self.slots.remove(key);
        }
    }

    fn live(&mut self, key: &str, now: i64) -> Option<&mut Slot> {
        self.purge_if_expired(key, now);
        self.slots.get_mut(key)
    }

    fn live_value(&mut self, key: &str, now: i64) -> Option<&mut Value> {
        self.live(key, now).map(|s| &mut s.value)
    }

    /// Get or create a collection value, enforcing its type.
    fn entry_with<F, T>(
        &mut self,
        key: &str,
        now: i64,
        init: F,
        pick: fn(&mut Value) -> Option<&mut T>,
    ) -> Result<&mut T>
    where
        F: FnOnce() -> Value,
    {
        self.purge_if_expired(key, now);
        let slot = self.slots.entry(key.to_string()).or_insert_with(|| Slot {
            value: init(),
            expires_at_ms: None,
        });
        pick(&mut slot.value).ok_or_else(|| wrong_type(key))
    }

    /// Remove the key if a collection became empty.
    fn drop_if_empty(&mut self, key: &str) {
        if self.slots.get(key).is_some_and(|s| s.value.is_empty()) {
            self.slots.remove(key);
        }
    }
}

macro_rules! picker {
    ($variant:ident, $ty:ty) => {{
        fn pick(v: &mut Value) -> Option<&mut $ty> {
            match v {
                Value::$variant(inner) => Some(inner),
                _ => None,
            }
        }
        pick
    }};
}

/// Resolve a Redis-style inclusive index range over `len` items.
fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// Glob match supporting `*` and `?`.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let (mut star, mut mark) = (None, 0usize);

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

fn haversine_m(a: GeoPosition, b: GeoPosition) -> f64 {
    let (lat1, lat2) = (a.latitude.to_radians(), b.latitude.to_radians());
    let dlat = lat2 - lat1;
    let dlon = (b.longitude - a.longitude).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

fn sorted_zset(z: &HashMap<String, f64>) -> Vec<(String, f64)> {
    let mut items: Vec<(String, f64)> = z.iter().map(|(m, s)| (m.clone(), *s)).collect();
    items.sort_by(|a, b| {
        a.1.total_cmp(&b.1)
            .then_with(|| a.0.as_bytes().cmp(b.0.as_bytes()))
    });
    items
}

/// In-process key/value store.
pub struct MemoryStore {
    keyspace: Mutex<Keyspace>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Create a store whose TTLs and stream ids follow `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            keyspace: Mutex::new(Keyspace::default()),
            clock,
        }
    }

    fn now(&self) -> i64 {
        self.clock.now_epoch_ms()
    }

    /// Number of live keys.
    pub async fn key_count(&self) -> usize {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        let keys: Vec<String> = ks.slots.keys().cloned().collect();
        keys.iter().filter(|k| ks.live(k, now).is_some()).count()
    }

    /// Delivery count of a pending stream entry, if it is pending.
    pub async fn stream_deliveries(&self, key: &str, group: &str, id: &str) -> Option<u64> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        match ks.live_value(key, now)? {
            Value::Stream(log) => log.deliveries(group, id),
            _ => None,
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        match ks.live_value(key, now) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        ks.slots.insert(
            key.to_string(),
            Slot {
                value: Value::Str(value.to_string()),
                expires_at_ms: ttl.map(|t| now + t.as_millis() as i64),
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        let mut removed = 0;
        for key in keys {
            ks.purge_if_expired(key, now);
            if ks.slots.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let now = self.now();
        Ok(self.keyspace.lock().await.live(key, now).is_some())
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        match ks.live(key, now) {
            Some(slot) => {
                slot.expires_at_ms = Some(now + (seconds as i64) * 1000);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        Ok(match ks.live(key, now) {
            None => KeyTtl::Missing,
            Some(Slot {
                expires_at_ms: None,
                ..
            }) => KeyTtl::Persistent,
            Some(Slot {
                expires_at_ms: Some(at),
                ..
            }) => KeyTtl::Remaining(((*at - now + 500) / 1000).max(0) as u64),
        })
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        let candidates: Vec<String> = ks
            .slots
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        let mut keys: Vec<String> = candidates
            .into_iter()
            .filter(|k| ks.live(k, now).is_some())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        let hash = ks.entry_with(
            key,
            now,
            || Value::Hash(HashMap::new()),
            picker!(Hash, HashMap<String, String>),
        )?;
        Ok(hash.insert(field.to_string(), value.to_string()).is_none())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        match ks.live_value(key, now) {
            None => Ok(None),
            Some(Value::Hash(h)) => Ok(h.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        match ks.live_value(key, now) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(h)) => Ok(h.clone()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        let removed = match ks.live_value(key, now) {
            None => false,
            Some(Value::Hash(h)) => h.remove(field).is_some(),
            Some(_) => return Err(wrong_type(key)),
        };
        ks.drop_if_empty(key);
        Ok(removed)
    }

    async fn hlen(&self, key: &str) -> Result<u64> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        match ks.live_value(key, now) {
            None => Ok(0),
            Some(Value::Hash(h)) => Ok(h.len() as u64),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        let set = ks.entry_with(
            key,
            now,
            || Value::Set(BTreeSet::new()),
            picker!(Set, BTreeSet<String>),
        )?;
        Ok(members.iter().filter(|m| set.insert((*m).clone())).count() as u64)
    }

    async fn srem(&self, key: &str, members: &[String]) -> Result<u64> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        let removed = match ks.live_value(key, now) {
            None => 0,
            Some(Value::Set(s)) => members.iter().filter(|m| s.remove(*m)).count() as u64,
            Some(_) => return Err(wrong_type(key)),
        };
        ks.drop_if_empty(key);
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        match ks.live_value(key, now) {
            None => Ok(Vec::new()),
            Some(Value::Set(s)) => Ok(s.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        match ks.live_value(key, now) {
            None => Ok(false),
            Some(Value::Set(s)) => Ok(s.contains(member)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn scard(&self, key: &str) -> Result<u64> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        match ks.live_value(key, now) {
            None => Ok(0),
            Some(Value::Set(s)) => Ok(s.len() as u64),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        let zset = ks.entry_with(
            key,
            now,
            || Value::ZSet(HashMap::new()),
            picker!(ZSet, HashMap<String, f64>),
        )?;
        Ok(zset.insert(member.to_string(), score).is_none())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        let removed = match ks.live_value(key, now) {
            None => false,
            Some(Value::ZSet(z)) => z.remove(member).is_some(),
            Some(_) => return Err(wrong_type(key)),
        };
        ks.drop_if_empty(key);
        Ok(removed)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        match ks.live_value(key, now) {
            None => Ok(None),
            Some(Value::ZSet(z)) => Ok(z.get(member).copied()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn zrange_withscores(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<(String, f64)>> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        let items = match ks.live_value(key, now) {
            None => return Ok(Vec::new()),
            Some(Value::ZSet(z)) => sorted_zset(z),
            Some(_) => return Err(wrong_type(key)),
        };
        Ok(match resolve_range(items.len(), start, stop) {
            Some((from, to)) => items[from..=to].to_vec(),
            None => Vec::new(),
        })
    }

    async fn zrangebyscore_withscores(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        match ks.live_value(key, now) {
            None => Ok(Vec::new()),
            Some(Value::ZSet(z)) => Ok(sorted_zset(z)
                .into_iter()
                .filter(|(_, s)| *s >= min && *s <= max)
                .collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        match ks.live_value(key, now) {
            None => Ok(0),
            Some(Value::ZSet(z)) => Ok(z.len() as u64),
            // Geo indexes are sorted sets on the server.
            Some(Value::Geo(g)) => Ok(g.len() as u64),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn lpush(&self, key: &str, values: &[String]) -> Result<u64> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        let list = ks.entry_with(
            key,
            now,
            || Value::List(VecDeque::new()),
            picker!(List, VecDeque<String>),
        )?;
        for v in values {
            list.push_front(v.clone());
        }
        Ok(list.len() as u64)
    }

    async fn rpush(&self, key: &str, values: &[String]) -> Result<u64> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        let list = ks.entry_with(
            key,
            now,
            || Value::List(VecDeque::new()),
            picker!(List, VecDeque<String>),
        )?;
        list.extend(values.iter().cloned());
        Ok(list.len() as u64)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        match ks.live_value(key, now) {
            None => Ok(Vec::new()),
            Some(Value::List(l)) => Ok(match resolve_range(l.len(), start, stop) {
                Some((from, to)) => l.range(from..=to).cloned().collect(),
                None => Vec::new(),
            }),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        match ks.live_value(key, now) {
            None => Ok(0),
            Some(Value::List(l)) => Ok(l.len() as u64),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        match ks.live_value(key, now) {
            None => return Ok(()),
            Some(Value::List(l)) => {
                *l = match resolve_range(l.len(), start, stop) {
                    Some((from, to)) => l.range(from..=to).cloned().collect(),
                    None => VecDeque::new(),
                };
            }
            Some(_) => return Err(wrong_type(key)),
        }
        ks.drop_if_empty(key);
        Ok(())
    }

    async fn pfadd(&self, key: &str, elements: &[String]) -> Result<bool> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        let created = ks.live(key, now).is_none();
        let hll = ks.entry_with(
            key,
            now,
            || Value::Hll(BTreeSet::new()),
            picker!(Hll, BTreeSet<String>),
        )?;
        let added = elements.iter().filter(|e| hll.insert((*e).clone())).count();
        Ok(created || added > 0)
    }

    async fn pfcount(&self, key: &str) -> Result<u64> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        match ks.live_value(key, now) {
            None => Ok(0),
            Some(Value::Hll(s)) => Ok(s.len() as u64),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn geoadd(&self, key: &str, position: GeoPosition, member: &str) -> Result<bool> {
        if !(-180.0..=180.0).contains(&position.longitude)
            || !(-85.051_128_78..=85.051_128_78).contains(&position.latitude)
        {
            return Err(StoreError::Command(format!(
                "ERR invalid longitude,latitude pair {},{}",
                position.longitude, position.latitude
            )));
        }
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        let geo = ks.entry_with(
            key,
            now,
            || Value::Geo(HashMap::new()),
            picker!(Geo, HashMap<String, GeoPosition>),
        )?;
        Ok(geo.insert(member.to_string(), position).is_none())
    }

    async fn geopos(&self, key: &str, member: &str) -> Result<Option<GeoPosition>> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        match ks.live_value(key, now) {
            None => Ok(None),
            Some(Value::Geo(g)) => Ok(g.get(member).copied()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn geodist(&self, key: &str, a: &str, b: &str, unit: GeoUnit) -> Result<Option<f64>> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        match ks.live_value(key, now) {
            None => Ok(None),
            Some(Value::Geo(g)) => Ok(match (g.get(a), g.get(b)) {
                (Some(pa), Some(pb)) => Some(haversine_m(*pa, *pb) / unit.meters()),
                _ => None,
            }),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn georadius(
        &self,
        key: &str,
        center: GeoPosition,
        radius: f64,
        unit: GeoUnit,
    ) -> Result<Vec<(String, f64)>> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        let geo = match ks.live_value(key, now) {
            None => return Ok(Vec::new()),
            Some(Value::Geo(g)) => g,
            Some(_) => return Err(wrong_type(key)),
        };
        let mut hits: Vec<(String, f64)> = geo
            .iter()
            .map(|(m, p)| (m.clone(), haversine_m(center, *p) / unit.meters()))
            .filter(|(_, d)| *d <= radius)
            .collect();
        hits.sort_by(|a, b| a.1.total_cmp(&b.1));
        Ok(hits)
    }

    async fn xadd(&self, key: &str, fields: &[(String, String)]) -> Result<String> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        let log = ks.entry_with(
            key,
            now,
            || Value::Stream(StreamLog::default()),
            picker!(Stream, StreamLog),
        )?;
        Ok(log.append(now.max(0) as u64, fields))
    }

    async fn xgroup_create(&self, key: &str, group: &str, start_id: &str) -> Result<()> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        let log = ks.entry_with(
            key,
            now,
            || Value::Stream(StreamLog::default()),
            picker!(Stream, StreamLog),
        )?;
        log.create_group(key, group, start_id)
    }

    async fn xreadgroup(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        _block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        match ks.live_value(key, now) {
            None => Err(StoreError::Command(format!(
                "NOGROUP No such key '{}' or consumer group '{}'",
                key, group
            ))),
            Some(Value::Stream(log)) => {
                log.read_group(key, group, consumer, &cursor, count, now.max(0) as u64)
            }
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn xack(&self, key: &str, group: &str, ids: &[String]) -> Result<u64> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        match ks.live_value(key, now) {
            None => Ok(0),
            Some(Value::Stream(log)) => Ok(log.ack(group, ids)),
            Some(_) => Err(wrong_type(key)),
        }
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
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        match ks.live_value(key, now) {
            None => Err(StoreError::Command(format!(
                "NOGROUP No such key '{}' or consumer group '{}'",
                key, group
            ))),
            Some(Value::Stream(log)) => log.claim(
                key,
                group,
                consumer,
                min_idle.as_millis() as u64,
                start,
                count,
                now.max(0) as u64,
            ),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn xrange(
        &self,
        key: &str,
        start: &str,
        end: &str,
        count: Option<usize>,
    ) -> Result<Vec<StreamEntry>> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        match ks.live_value(key, now) {
            None => Ok(Vec::new()),
            Some(Value::Stream(log)) => log.range(start, end, count),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn xlen(&self, key: &str) -> Result<u64> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        match ks.live_value(key, now) {
            None => Ok(0),
            Some(Value::Stream(log)) => Ok(log.len()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn xpending_count(&self, key: &str, group: &str) -> Result<u64> {
        let now = self.now();
        let mut ks = self.keyspace.lock().await;
        match ks.live_value(key, now) {
            None => Ok(0),
            Some(Value::Stream(log)) => Ok(log.pending_count(group)),
            Some(_) => Err(wrong_type(key)),
        }
    }
}
