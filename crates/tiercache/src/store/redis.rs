//! Redis implementation of [`SharedStore`] over a deadpool connection pool.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Pool, PoolConfig, Runtime, Timeouts};
use redis::AsyncCommands;

use super::SharedStore;
use crate::config::RedisConfig;
use crate::error::{CacheError, CacheResult};

/// Deletes KEYS[1] only if it still holds ARGV[1].
const RELEASE_IF_OWNER: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Pooled Redis client.
///
/// Each command is bounded by `command_timeout`, separate from the pool's
/// own acquisition timeout.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    url: String,
    command_timeout: Duration,
    release_script: redis::Script,
}

impl RedisStore {
    pub fn new(pool: Pool, url: impl Into<String>, command_timeout: Duration) -> Self {
        Self {
            pool,
            url: url.into(),
            command_timeout,
            release_script: redis::Script::new(RELEASE_IF_OWNER),
        }
    }

    /// Build the connection pool described by `config`.
    ///
    /// Creating the pool does not open a connection; an unreachable server
    /// only shows up on the first command.
    pub fn from_config(config: &RedisConfig) -> CacheResult<Self> {
        let mut redis_config = deadpool_redis::Config::from_url(&config.url);

        let mut timeouts = Timeouts::default();
        timeouts.wait = Some(config.timeout());
        timeouts.create = Some(config.timeout());
        timeouts.recycle = Some(config.timeout());
        let mut pool_config = PoolConfig::new(config.pool_size);
        pool_config.timeouts = timeouts;
        redis_config.pool = Some(pool_config);

        let pool = redis_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| CacheError::store_unavailable(format!("failed to create Redis pool: {e}")))?;

        Ok(Self::new(pool, config.url.clone(), config.command_timeout()))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn conn(&self) -> CacheResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> CacheResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(result) => result.map_err(CacheError::from),
            Err(_) => Err(CacheError::store_unavailable(format!(
                "{op} timed out after {:?}",
                self.command_timeout
            ))),
        }
    }
}

fn millis(ttl: Duration) -> u64 {
    // PX 0 is rejected by Redis
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        self.bounded("GET", conn.get(key)).await
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        let mut conn = self.conn().await?;
        self.bounded("SET", conn.pset_ex(key, value, millis(ttl)))
            .await
    }

    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = self
            .bounded(
                "SET NX",
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(millis(ttl))
                    .query_async(&mut conn),
            )
            .await?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.conn().await?;
        self.bounded("DEL", conn.del(key)).await
    }

    async fn del_if_eq(&self, key: &str, expected: &[u8]) -> CacheResult<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = self
            .bounded(
                "EVALSHA",
                self.release_script
                    .key(key)
                    .arg(expected)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(removed > 0)
    }

    async fn incr(&self, key: &str) -> CacheResult<i64> {
        let mut conn = self.conn().await?;
        self.bounded("INCR", conn.incr(key, 1)).await
    }

    async fn incr_many(&self, keys: &[String]) -> CacheResult<Vec<i64>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.incr(key, 1);
        }
        let mut conn = self.conn().await?;
        self.bounded("INCR (pipelined)", pipe.query_async(&mut conn))
            .await
    }

    async fn mget(&self, keys: &[String]) -> CacheResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        // explicit MGET: the typed helper sends GET for a single key
        let mut conn = self.conn().await?;
        self.bounded("MGET", redis::cmd("MGET").arg(keys).query_async(&mut conn))
            .await
    }

    async fn publish(&self, channel: &str, message: &str) -> CacheResult<()> {
        let mut conn = self.conn().await?;
        self.bounded("PUBLISH", conn.publish(channel, message))
            .await
    }

    async fn ping(&self) -> CacheResult<()> {
        let mut conn = self.conn().await?;
        let _: String = self
            .bounded("PING", redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(())
    }

    fn mode(&self) -> &'static str {
        "redis"
    }
}
