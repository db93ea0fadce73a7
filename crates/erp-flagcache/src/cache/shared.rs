//! Shared (L2) feature flag cache stored in Redis.
//!
//! Values are JSON-encoded under namespaced keys:
//!
//! - flags: `feature_flag:<flag_key>`
//! - overrides: `feature_flag:override:<flag_key>:<target_type>:<target_id>`
//!
//! Every key carries a server-side expiry, so Redis is the authority on L2 TTL.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Pool, Runtime};
use redis::AsyncCommands;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::FlagCache;
use super::types::{CachedFlag, CachedOverride, OverrideKey};
use crate::config::{CacheConfig, RedisConfig};
use crate::error::{CacheError, CacheResult};

pub const KEY_PREFIX: &str = "feature_flag:";
const OVERRIDE_PREFIX: &str = "feature_flag:override:";

/// Whether a component is responsible for shutting down the pool it uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOwnership {
    /// Created the pool itself; `close` closes it.
    Owned,
    /// Was handed a pool by the caller; `close` leaves it open.
    Borrowed,
}

pub fn flag_key(key: &str) -> String {
    format!("{KEY_PREFIX}{key}")
}

pub fn override_key(key: &OverrideKey) -> String {
    format!(
        "{OVERRIDE_PREFIX}{}:{}:{}",
        key.flag_key, key.target_type, key.target_id
    )
}

/// Build a connection pool from the Redis settings.
///
/// The pool is lazy; call [`verify_pool`] to make sure the server is reachable.
pub fn create_pool(config: &RedisConfig) -> CacheResult<Pool> {
    let mut redis_config = deadpool_redis::Config::from_url(config.connection_url());
    let mut pool_config = deadpool_redis::PoolConfig::new(config.pool_size.max(1));
    pool_config.timeouts.wait = Some(config.timeout());
    pool_config.timeouts.create = Some(config.timeout());
    pool_config.timeouts.recycle = Some(config.timeout());
    redis_config.pool = Some(pool_config);

    redis_config
        .create_pool(Some(Runtime::Tokio1))
        .map_err(CacheError::pool)
}

/// Round-trip a PING through the pool.
pub async fn verify_pool(pool: &Pool) -> CacheResult<()> {
    let mut conn = pool.get().await?;
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;
    Ok(())
}

/// Redis-backed cache tier shared by every instance.
pub struct RedisFlagCache {
    pool: Pool,
    config: CacheConfig,
    ownership: ConnectionOwnership,
    closed: AtomicBool,
}

impl RedisFlagCache {
    /// Connect with a pool of its own. The pool is closed by [`FlagCache::close`].
    pub async fn connect(redis: &RedisConfig, config: CacheConfig) -> CacheResult<Self> {
        tracing::info!(
            host = %redis.host,
            db = redis.db,
            "connecting feature flag L2 cache to Redis"
        );
        let pool = create_pool(redis)?;
        verify_pool(&pool).await?;
        Ok(Self::new(pool, config, ConnectionOwnership::Owned))
    }

    pub fn new(pool: Pool, config: CacheConfig, ownership: ConnectionOwnership) -> Self {
        Self {
            pool,
            config: config.normalized(),
            ownership,
            closed: AtomicBool::new(false),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn ownership(&self) -> ConnectionOwnership {
        self.ownership
    }

    /// Remaining TTL of a flag entry, `None` when the key does not exist.
    pub async fn flag_ttl_remaining(&self, key: &str) -> CacheResult<Option<Duration>> {
        let mut conn = self.pool.get().await?;
        let ttl_ms: i64 = conn.pttl(flag_key(key)).await?;
        Ok(u64::try_from(ttl_ms).ok().map(Duration::from_millis))
    }

    async fn read<T: DeserializeOwned>(&self, redis_key: &str) -> CacheResult<Option<T>> {
        let mut conn = self.pool.get().await?;
        let raw: Option<String> = conn.get(redis_key).await?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        match serde_json::from_str::<T>(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(
                    key = %redis_key,
                    error = %e,
                    "corrupted feature flag cache entry, removing"
                );
                if let Err(del_err) = conn.del::<_, ()>(redis_key).await {
                    tracing::warn!(key = %redis_key, error = %del_err, "failed to remove corrupted entry");
                }
                Err(CacheError::Deserialization {
                    key: redis_key.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    async fn write<T: Serialize>(&self, redis_key: &str, value: &T, ttl: Duration) -> CacheResult<()> {
        let json =
            serde_json::to_string(value).map_err(|e| CacheError::Serialization(e.to_string()))?;
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        let mut conn = self.pool.get().await?;
        let _: () = redis::cmd("PSETEX")
            .arg(redis_key)
            .arg(ttl_ms)
            .arg(json)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove(&self, redis_key: &str) -> CacheResult<()> {
        let mut conn = self.pool.get().await?;
        conn.del::<_, ()>(redis_key).await?;
        Ok(())
    }

    fn ttl_or(&self, ttl: Duration, default: Duration) -> Duration {
        if ttl.is_zero() { default } else { ttl }
    }
}

#[async_trait]
impl FlagCache for RedisFlagCache {
    async fn get(&self, key: &str) -> CacheResult<Option<Arc<CachedFlag>>> {
        let flag: Option<CachedFlag> = self.read(&flag_key(key)).await?;
        Ok(flag.map(Arc::new))
    }

    async fn set(&self, key: &str, flag: Arc<CachedFlag>, ttl: Duration) -> CacheResult<()> {
        if flag.is_empty() {
            tracing::debug!(key = %key, "ignoring empty flag snapshot (L2)");
            return Ok(());
        }
        let ttl = self.ttl_or(ttl, self.config.flag_ttl());
        self.write(&flag_key(key), flag.as_ref(), ttl).await
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.remove(&flag_key(key)).await
    }

    async fn get_override(&self, key: &OverrideKey) -> CacheResult<Option<Arc<CachedOverride>>> {
        let value: Option<CachedOverride> = self.read(&override_key(key)).await?;
        Ok(value.map(Arc::new))
    }

    async fn set_override(
        &self,
        flag_override: Arc<CachedOverride>,
        ttl: Duration,
    ) -> CacheResult<()> {
        if flag_override.is_empty() {
            tracing::debug!(key = %flag_override.key, "ignoring empty override snapshot (L2)");
            return Ok(());
        }
        let ttl = self.ttl_or(ttl, self.config.override_ttl());
        self.write(&override_key(&flag_override.key), flag_override.as_ref(), ttl)
            .await
    }

    async fn delete_override(&self, key: &OverrideKey) -> CacheResult<()> {
        self.remove(&override_key(key)).await
    }

    /// Incrementally SCAN `feature_flag:*` and delete each batch.
    ///
    /// Never uses KEYS, so the server is not blocked on large keyspaces. Keys
    /// written while the scan runs may survive it.
    async fn invalidate_all(&self) -> CacheResult<()> {
        let pattern = format!("{KEY_PREFIX}*");
        let mut conn = self.pool.get().await?;
        let mut cursor: u64 = 0;
        let mut deleted = 0usize;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(self.config.scan_batch_size)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                deleted += keys.len();
                conn.del::<_, ()>(keys).await?;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        tracing::info!(deleted, "invalidated all feature flag entries in L2");
        Ok(())
    }

    async fn ping(&self) -> CacheResult<()> {
        verify_pool(&self.pool).await
    }

    async fn close(&self) -> CacheResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.ownership == ConnectionOwnership::Owned {
            self.pool.close();
            tracing::debug!("L2 flag cache closed its Redis pool");
        }
        Ok(())
    }
}
