use async_trait::async_trait;
use redis::aio::ConnectionManager;

use crate::cache::Cache;
use crate::{Error, Result};

#[derive(Clone)]
pub struct RedisCache {
    manager: ConnectionManager,
}

impl RedisCache {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Cache for RedisCache {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::backend("redis get", e))
    }

    #[tracing::instrument(level = "debug", skip(self, value))]
    async fn set_ex(&self, key: &str, ttl_secs: u64, value: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("SETEX")
            .arg(key)
            .arg(ttl_secs)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| Error::backend("redis setex", e))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        redis::cmd("KEYS")
            .arg(pattern)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::backend("redis keys", e))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn del(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key);
        }
        let n: i64 = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::backend("redis del", e))?;
        Ok(n.max(0) as u64)
    }
}
