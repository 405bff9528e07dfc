//! Cache layer for analytics responses.
//!
//! Keys follow `analytics:{connection_id}:{endpoint}:{params_hash}` so a
//! single pattern delete invalidates everything for a connection. A cache
//! backend outage is never fatal: reads miss, writes are dropped, and a
//! warning is logged; analytics then serves straight from the store.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::cache::Cache;

pub const CACHE_TTL_SECS: u64 = 300;
pub const KEY_PREFIX: &str = "analytics";

/// Canonical parameter bag: BTreeMap ordering makes the hash stable across
/// call sites regardless of insertion order.
pub type CacheParams = BTreeMap<String, String>;

#[derive(Clone)]
pub struct AnalyticsCache {
    cache: Arc<dyn Cache>,
}

impl AnalyticsCache {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    fn build_key(connection_id: &str, endpoint: &str, params: &CacheParams) -> String {
        let canonical = serde_json::to_string(params).unwrap_or_default();
        let digest = Sha256::digest(canonical.as_bytes());
        let mut hash = String::with_capacity(16);
        for byte in digest.iter().take(8) {
            use std::fmt::Write as _;
            let _ = write!(&mut hash, "{byte:02x}");
        }
        format!("{KEY_PREFIX}:{connection_id}:{endpoint}:{hash}")
    }

    pub async fn get(
        &self,
        connection_id: &str,
        endpoint: &str,
        params: &CacheParams,
    ) -> Option<Value> {
        let key = Self::build_key(connection_id, endpoint, params);
        match self.cache.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => {
                    tracing::debug!(%key, "analytics cache hit");
                    Some(value)
                }
                Err(err) => {
                    tracing::warn!(%key, error = %err, "corrupt analytics cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(%key, error = %err, "analytics cache get failed");
                None
            }
        }
    }

    pub async fn set(
        &self,
        connection_id: &str,
        endpoint: &str,
        params: &CacheParams,
        data: &Value,
    ) {
        let key = Self::build_key(connection_id, endpoint, params);
        let serialized = data.to_string();
        if let Err(err) = self.cache.set_ex(&key, CACHE_TTL_SECS, &serialized).await {
            tracing::warn!(%key, error = %err, "analytics cache set failed");
        }
    }

    /// Remove every entry carrying the connection prefix. Returns how many
    /// were deleted; 0 on backend failure.
    pub async fn invalidate(&self, connection_id: &str) -> u64 {
        let pattern = format!("{KEY_PREFIX}:{connection_id}:*");
        let keys = match self.cache.keys(&pattern).await {
            Ok(keys) => keys,
            Err(err) => {
                tracing::warn!(%connection_id, error = %err, "analytics cache scan failed");
                return 0;
            }
        };
        if keys.is_empty() {
            return 0;
        }
        match self.cache.del(&keys).await {
            Ok(deleted) => {
                tracing::info!(%connection_id, deleted, "invalidated analytics cache");
                deleted
            }
            Err(err) => {
                tracing::warn!(%connection_id, error = %err, "analytics cache delete failed");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use serde_json::json;

    fn params(pairs: &[(&str, &str)]) -> CacheParams {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn hash_is_stable_across_insertion_order() {
        let a = params(&[("date_from", "2024-01-01"), ("date_to", "2024-01-31")]);
        let b = params(&[("date_to", "2024-01-31"), ("date_from", "2024-01-01")]);
        assert_eq!(
            AnalyticsCache::build_key("c1", "summary", &a),
            AnalyticsCache::build_key("c1", "summary", &b)
        );
        assert_ne!(
            AnalyticsCache::build_key("c1", "summary", &a),
            AnalyticsCache::build_key("c2", "summary", &a)
        );
    }

    #[tokio::test]
    async fn invalidate_removes_only_the_connection_prefix() {
        let cache = AnalyticsCache::new(Arc::new(MemoryCache::new()));
        let p = params(&[]);
        cache.set("conn_a", "summary", &p, &json!({"total_count": 1})).await;
        cache.set("conn_a", "top", &p, &json!({"data": []})).await;
        cache.set("conn_b", "summary", &p, &json!({"total_count": 2})).await;

        assert!(cache.get("conn_a", "summary", &p).await.is_some());
        assert_eq!(cache.invalidate("conn_a").await, 2);
        assert!(cache.get("conn_a", "summary", &p).await.is_none());
        assert!(cache.get("conn_b", "summary", &p).await.is_some());
    }
}
