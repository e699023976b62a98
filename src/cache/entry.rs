use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A cached payload with its own freshness window.
///
/// The store TTL and the embedded window normally agree; the embedded check
/// guards against keys whose store TTL was extended or removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub logical_key: String,
    pub payload: Value,
    pub cached_at_epoch_ms: i64,
    pub ttl_seconds: u64,
}

impl CacheEntry {
    pub fn is_fresh(&self, now_epoch_ms: i64) -> bool {
        let ttl_ms = i64::try_from(self.ttl_seconds.saturating_mul(1000)).unwrap_or(i64::MAX);
        now_epoch_ms.saturating_sub(self.cached_at_epoch_ms) < ttl_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(cached_at: i64, ttl: u64) -> CacheEntry {
        CacheEntry {
            logical_key: "query:abc".to_string(),
            payload: json!([1, 2]),
            cached_at_epoch_ms: cached_at,
            ttl_seconds: ttl,
        }
    }

    #[test]
    fn test_freshness_window_is_half_open() {
        let e = entry(1_000, 2);
        assert!(e.is_fresh(1_000));
        assert!(e.is_fresh(2_999));
        assert!(!e.is_fresh(3_000));
    }

    #[test]
    fn test_wire_format_is_camel_case() {
        let text = serde_json::to_string(&entry(5, 60)).unwrap();
        assert!(text.contains("\"logicalKey\""));
        assert!(text.contains("\"cachedAtEpochMs\":5"));
        assert!(text.contains("\"ttlSeconds\":60"));
    }
}
