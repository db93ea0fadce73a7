//! Multi-tier feature flag cache for the ERP backend.
//!
//! A per-instance L1 ([`cache::LocalFlagCache`]) sits in front of a shared Redis L2
//! ([`cache::RedisFlagCache`]); writes are broadcast over Redis Pub/Sub
//! ([`cache::RedisFlagCacheInvalidator`]) so every instance evicts its stale L1
//! copy. [`cache::TieredFlagCache`] composes the three.
//!
//! ```no_run
//! # async fn run() -> Result<(), erp_flagcache::CacheError> {
//! use erp_flagcache::{AppConfig, FlagCache, connect_tiered_cache};
//!
//! let cache = connect_tiered_cache(&AppConfig::default()).await?;
//! let listener = cache.spawn_invalidation_listener();
//!
//! if let Some(flag) = cache.get("checkout-v2").await? {
//!     println!("{}", flag.payload);
//! }
//!
//! cache.close().await?;
//! let _ = listener.await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod observability;

use std::sync::Arc;

pub use cache::{
    CacheStats, CacheUpdateAction, CacheUpdateMessage, CachedFlag, CachedOverride,
    ConnectionOwnership, FlagCache, FlagSource, InProcessBroker, InvalidationChannel,
    LocalFlagCache, OverrideKey, OverrideTargetType, RedisFlagCache, RedisFlagCacheInvalidator,
    TieredFlagCache,
};
pub use config::{AppConfig, CacheConfig, RedisConfig};
pub use error::{CacheError, CacheResult};

/// Build the full Redis-backed tiered cache from configuration.
///
/// One pool is created and shared: the L2 cache owns it (and closes it), the
/// invalidator borrows it for publishing and opens its own subscriber
/// connection.
pub async fn connect_tiered_cache(config: &AppConfig) -> CacheResult<Arc<TieredFlagCache>> {
    let cache_config = config.cache.clone().normalized();

    tracing::info!(
        host = %config.redis.host,
        port = config.redis.port,
        db = config.redis.db,
        channel = %cache_config.invalidation_channel,
        "connecting feature flag cache to Redis"
    );

    let pool = cache::shared::create_pool(&config.redis)?;
    cache::shared::verify_pool(&pool).await?;
    tracing::info!("connected to Redis");

    let invalidator = RedisFlagCacheInvalidator::from_pool(
        pool.clone(),
        &config.redis,
        cache_config.clone(),
    )?;
    let l2 = RedisFlagCache::new(pool, cache_config.clone(), ConnectionOwnership::Owned);
    let l1 = LocalFlagCache::new(cache_config.clone());

    Ok(Arc::new(TieredFlagCache::new(
        Arc::new(l1),
        Arc::new(l2),
        Some(Arc::new(invalidator)),
        cache_config,
    )))
}
