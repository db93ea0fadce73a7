//! Tiered orchestrator: L1 in front of L2, with invalidation broadcast.
//!
//! ## Read path
//!
//! L1 hit → return. L1 miss → L2; an L2 hit backfills L1 with the L1 TTL. A miss
//! on both tiers is `Ok(None)` and the caller consults the flag repository
//! (or use [`TieredFlagCache::get_or_load`] with a [`FlagSource`]).
//!
//! ## Write path
//!
//! L2 first. If that fails the write is aborted with no L1 change and no
//! broadcast. Otherwise L1 is updated for read-your-writes, then a message is
//! published so other instances evict their copy. Publish failures are logged
//! and counted, never returned: the shared tier is already correct.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use super::FlagCache;
use super::local::LocalFlagCache;
use super::pubsub::{InvalidationChannel, InvalidationHandler};
use super::types::{
    CacheStats, CacheUpdateAction, CacheUpdateMessage, CachedFlag, CachedOverride, OverrideKey,
};
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::metrics;

/// Authoritative store consulted when both tiers miss.
#[async_trait]
pub trait FlagSource: Send + Sync {
    async fn load_flag(&self, key: &str) -> anyhow::Result<Option<CachedFlag>>;

    async fn load_override(&self, key: &OverrideKey) -> anyhow::Result<Option<CachedOverride>>;

    /// Every flag worth caching ahead of the first read, used by
    /// [`TieredFlagCache::warmup`].
    async fn load_all_flags(&self) -> anyhow::Result<Vec<CachedFlag>>;
}

pub struct TieredFlagCache {
    l1: Arc<LocalFlagCache>,
    l2: Arc<dyn FlagCache>,
    invalidator: Option<Arc<dyn InvalidationChannel>>,
    config: CacheConfig,
    l1_hits: AtomicU64,
    l1_misses: AtomicU64,
    l2_hits: AtomicU64,
    l2_misses: AtomicU64,
}

impl TieredFlagCache {
    /// Compose the tiers. Without an invalidator writes stay local to L2 + own L1
    /// and other instances only converge when their L1 entries expire.
    pub fn new(
        l1: Arc<LocalFlagCache>,
        l2: Arc<dyn FlagCache>,
        invalidator: Option<Arc<dyn InvalidationChannel>>,
        config: CacheConfig,
    ) -> Self {
        Self {
            l1,
            l2,
            invalidator,
            config: config.normalized(),
            l1_hits: AtomicU64::new(0),
            l1_misses: AtomicU64::new(0),
            l2_hits: AtomicU64::new(0),
            l2_misses: AtomicU64::new(0),
        }
    }

    pub fn l1(&self) -> &Arc<LocalFlagCache> {
        &self.l1
    }

    pub fn invalidator(&self) -> Option<&Arc<dyn InvalidationChannel>> {
        self.invalidator.as_ref()
    }

    /// Subscribe to the invalidation channel and apply messages to L1.
    ///
    /// Blocks until the channel is closed. Returns immediately when the cache
    /// has no invalidator.
    pub async fn start_invalidation_subscription(&self) -> CacheResult<()> {
        let Some(ref invalidator) = self.invalidator else {
            return Ok(());
        };

        let l1 = Arc::clone(&self.l1);
        let handler: InvalidationHandler =
            Arc::new(move |msg: CacheUpdateMessage| apply_invalidation(&l1, &msg));

        invalidator.subscribe(handler).await
    }

    /// Run [`Self::start_invalidation_subscription`] on its own task.
    pub fn spawn_invalidation_listener(self: &Arc<Self>) -> JoinHandle<CacheResult<()>> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let result = cache.start_invalidation_subscription().await;
            if let Err(ref e) = result {
                tracing::error!(error = %e, "invalidation subscription ended with error");
            }
            result
        })
    }

    pub fn get_cache_stats(&self) -> CacheStats {
        let mut stats = CacheStats::from_counters(
            self.l1_hits.load(Ordering::Relaxed),
            self.l1_misses.load(Ordering::Relaxed),
            self.l2_hits.load(Ordering::Relaxed),
            self.l2_misses.load(Ordering::Relaxed),
        );
        let (flags, overrides) = self.l1.count();
        stats.cache_entries = flags + overrides;
        stats
    }

    pub fn reset_stats(&self) {
        self.l1_hits.store(0, Ordering::Relaxed);
        self.l1_misses.store(0, Ordering::Relaxed);
        self.l2_hits.store(0, Ordering::Relaxed);
        self.l2_misses.store(0, Ordering::Relaxed);
        self.l1.reset_stats();
    }

    pub async fn get_l1(&self, key: &str) -> CacheResult<Option<Arc<CachedFlag>>> {
        self.l1.get(key).await
    }

    pub async fn set_l1(&self, key: &str, flag: Arc<CachedFlag>, ttl: Duration) -> CacheResult<()> {
        self.l1.set(key, flag, ttl).await
    }

    pub async fn invalidate_l1(&self, key: &str) -> CacheResult<()> {
        self.l1.delete(key).await
    }

    pub async fn is_shared_tier_available(&self) -> bool {
        match self.l2.ping().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "shared flag cache tier unavailable");
                false
            }
        }
    }

    /// Tiered read; on a double miss load from `source` and populate both tiers.
    ///
    /// An unreachable shared tier is treated like a miss so flag evaluation
    /// keeps working from the source. Loading is not a change, so nothing is
    /// broadcast.
    pub async fn get_or_load(
        &self,
        key: &str,
        source: &dyn FlagSource,
    ) -> CacheResult<Option<Arc<CachedFlag>>> {
        match self.get(key).await {
            Ok(Some(flag)) => return Ok(Some(flag)),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "flag cache read failed, loading from source");
            }
        }

        let Some(flag) = source
            .load_flag(key)
            .await
            .map_err(|e| CacheError::Source(format!("{e:#}")))?
        else {
            return Ok(None);
        };
        let flag = Arc::new(flag);

        if let Err(e) = self.l2.set(key, Arc::clone(&flag), Duration::ZERO).await {
            tracing::warn!(key = %key, error = %e, "failed to populate L2 after load");
        }
        self.l1.set(key, Arc::clone(&flag), self.config.l1_ttl()).await?;

        Ok(Some(flag))
    }

    pub async fn get_or_load_override(
        &self,
        key: &OverrideKey,
        source: &dyn FlagSource,
    ) -> CacheResult<Option<Arc<CachedOverride>>> {
        match self.get_override(key).await {
            Ok(Some(value)) => return Ok(Some(value)),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "override cache read failed, loading from source");
            }
        }

        let Some(value) = source
            .load_override(key)
            .await
            .map_err(|e| CacheError::Source(format!("{e:#}")))?
        else {
            return Ok(None);
        };
        let value = Arc::new(value);

        if let Err(e) = self.l2.set_override(Arc::clone(&value), Duration::ZERO).await {
            tracing::warn!(key = %key, error = %e, "failed to populate L2 after load");
        }
        self.l1
            .set_override(Arc::clone(&value), self.config.l1_ttl())
            .await?;

        Ok(Some(value))
    }

    /// Bulk-load flags from `source` into both tiers. Returns how many were cached.
    ///
    /// Same population rules as [`Self::get_or_load`]: L2 is best effort and
    /// nothing is broadcast. Empty snapshots are skipped.
    pub async fn warmup(&self, source: &dyn FlagSource) -> CacheResult<usize> {
        let flags = source
            .load_all_flags()
            .await
            .map_err(|e| CacheError::Source(format!("{e:#}")))?;

        let mut loaded = 0;
        for flag in flags {
            if flag.is_empty() {
                continue;
            }
            let flag = Arc::new(flag);
            let key = flag.key.clone();

            if let Err(e) = self.l2.set(&key, Arc::clone(&flag), Duration::ZERO).await {
                tracing::warn!(key = %key, error = %e, "failed to populate L2 during warmup");
            }
            self.l1.set(&key, flag, self.config.l1_ttl()).await?;
            loaded += 1;
        }

        tracing::info!(flags = loaded, "feature flag cache warmed up");
        Ok(loaded)
    }

    /// L1 TTL for a write: never longer than the TTL the caller gave L2.
    fn write_l1_ttl(&self, ttl: Duration) -> Duration {
        if ttl.is_zero() {
            self.config.l1_ttl()
        } else {
            ttl.min(self.config.l1_ttl())
        }
    }

    fn record_l1(&self, hit: bool) {
        if hit {
            self.l1_hits.fetch_add(1, Ordering::Relaxed);
            metrics::record_cache_hit("l1");
        } else {
            self.l1_misses.fetch_add(1, Ordering::Relaxed);
            metrics::record_cache_miss("l1");
        }
    }

    fn record_l2(&self, hit: bool) {
        if hit {
            self.l2_hits.fetch_add(1, Ordering::Relaxed);
            metrics::record_cache_hit("l2");
        } else {
            self.l2_misses.fetch_add(1, Ordering::Relaxed);
            metrics::record_cache_miss("l2");
        }
    }

    /// L2 read result with a corrupted entry downgraded to a miss.
    ///
    /// L2 has already deleted the entry; transport errors still propagate.
    fn l2_answer<T>(key: &(dyn std::fmt::Display + Sync), result: CacheResult<Option<T>>) -> CacheResult<Option<T>> {
        match result {
            Err(CacheError::Deserialization { message, .. }) => {
                tracing::warn!(key = %key, error = %message, "discarded corrupted L2 entry");
                Ok(None)
            }
            other => other,
        }
    }

    async fn broadcast(&self, msg: CacheUpdateMessage) {
        let Some(ref invalidator) = self.invalidator else {
            return;
        };
        let action = msg.action;
        let flag_key = msg.flag_key.clone();

        if let Err(e) = invalidator.publish(msg).await {
            metrics::record_publish_failure();
            tracing::warn!(
                action = %action,
                flag_key = %flag_key,
                error = %e,
                "failed to publish cache invalidation"
            );
        }
    }
}

/// Apply one invalidation message to the local tier. Never fetches.
pub fn apply_invalidation(l1: &LocalFlagCache, msg: &CacheUpdateMessage) {
    metrics::record_invalidation_received(msg.action.as_str());

    match msg.action {
        CacheUpdateAction::FlagUpdated | CacheUpdateAction::FlagDeleted => {
            l1.evict(&msg.flag_key);
            tracing::debug!(action = %msg.action, flag_key = %msg.flag_key, "invalidated L1 flag");
        }
        CacheUpdateAction::OverrideUpdated | CacheUpdateAction::OverrideDeleted => {
            match msg.override_key() {
                Ok(Some(key)) => {
                    l1.evict_override(&key);
                    tracing::debug!(action = %msg.action, key = %key, "invalidated L1 override");
                }
                Ok(None) => {
                    tracing::debug!(flag_key = %msg.flag_key, "override message without target, ignored");
                }
                Err(e) => {
                    tracing::error!(
                        flag_key = %msg.flag_key,
                        target_type = %msg.target_type,
                        target_id = %msg.target_id,
                        error = %e,
                        "invalid override target in invalidation message"
                    );
                }
            }
        }
        CacheUpdateAction::InvalidateAll => {
            l1.clear();
            tracing::info!("invalidated all L1 entries");
        }
    }
}

#[async_trait]
impl FlagCache for TieredFlagCache {
    async fn get(&self, key: &str) -> CacheResult<Option<Arc<CachedFlag>>> {
        if let Some(flag) = self.l1.get(key).await? {
            self.record_l1(true);
            return Ok(Some(flag));
        }
        self.record_l1(false);

        let Some(flag) = Self::l2_answer(&key, self.l2.get(key).await)? else {
            self.record_l2(false);
            return Ok(None);
        };
        self.record_l2(true);

        if let Err(e) = self.l1.set(key, Arc::clone(&flag), self.config.l1_ttl()).await {
            tracing::warn!(key = %key, error = %e, "failed to populate L1 cache");
        }
        Ok(Some(flag))
    }

    async fn set(&self, key: &str, flag: Arc<CachedFlag>, ttl: Duration) -> CacheResult<()> {
        self.l2.set(key, Arc::clone(&flag), ttl).await?;

        if let Err(e) = self.l1.set(key, flag, self.write_l1_ttl(ttl)).await {
            tracing::warn!(key = %key, error = %e, "failed to populate L1 cache");
        }

        self.broadcast(CacheUpdateMessage::flag_updated(key)).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.l2.delete(key).await?;
        self.l1.evict(key);
        self.broadcast(CacheUpdateMessage::flag_deleted(key)).await;
        Ok(())
    }

    async fn get_override(&self, key: &OverrideKey) -> CacheResult<Option<Arc<CachedOverride>>> {
        if let Some(value) = self.l1.get_override(key).await? {
            self.record_l1(true);
            return Ok(Some(value));
        }
        self.record_l1(false);

        let Some(value) = Self::l2_answer(key, self.l2.get_override(key).await)? else {
            self.record_l2(false);
            return Ok(None);
        };
        self.record_l2(true);

        if let Err(e) = self
            .l1
            .set_override(Arc::clone(&value), self.config.l1_ttl())
            .await
        {
            tracing::warn!(key = %key, error = %e, "failed to populate L1 cache");
        }
        Ok(Some(value))
    }

    async fn set_override(
        &self,
        flag_override: Arc<CachedOverride>,
        ttl: Duration,
    ) -> CacheResult<()> {
        self.l2.set_override(Arc::clone(&flag_override), ttl).await?;

        let msg = CacheUpdateMessage::override_updated(&flag_override.key);
        if let Err(e) = self
            .l1
            .set_override(flag_override, self.write_l1_ttl(ttl))
            .await
        {
            tracing::warn!(error = %e, "failed to populate L1 cache");
        }

        self.broadcast(msg).await;
        Ok(())
    }

    async fn delete_override(&self, key: &OverrideKey) -> CacheResult<()> {
        self.l2.delete_override(key).await?;
        self.l1.evict_override(key);
        self.broadcast(CacheUpdateMessage::override_deleted(key)).await;
        Ok(())
    }

    /// L2, then L1, then broadcast; so L1 is never newer than L2.
    async fn invalidate_all(&self) -> CacheResult<()> {
        self.l2.invalidate_all().await?;
        self.l1.clear();
        self.broadcast(CacheUpdateMessage::invalidate_all()).await;
        Ok(())
    }

    async fn ping(&self) -> CacheResult<()> {
        self.l2.ping().await
    }

    /// Close invalidator, L2 and L1 in that order. Every tier is closed even if
    /// an earlier one fails; the last error is returned.
    async fn close(&self) -> CacheResult<()> {
        let mut last_err = None;

        if let Some(ref invalidator) = self.invalidator {
            if let Err(e) = invalidator.close().await {
                tracing::warn!(error = %e, "failed to close invalidation channel");
                last_err = Some(e);
            }
        }
        if let Err(e) = self.l2.close().await {
            tracing::warn!(error = %e, "failed to close L2 flag cache");
            last_err = Some(e);
        }
        if let Err(e) = self.l1.close().await {
            last_err = Some(e);
        }

        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
