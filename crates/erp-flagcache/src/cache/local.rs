//! Local (L1) feature flag cache.
//!
//! Two DashMaps (flags and overrides) hold `Arc`-wrapped snapshots with an
//! absolute expiry. Expired entries are dropped lazily on read and by a
//! background sweep, so memory stays bounded even for keys nobody reads again.

use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::watch;

use super::FlagCache;
use super::types::{CacheEntry, CachedFlag, CachedOverride, OverrideKey};
use crate::config::CacheConfig;
use crate::error::CacheResult;

/// Snapshot of the local cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalCacheStats {
    pub flags: usize,
    pub overrides: usize,
    pub hits: u64,
    pub misses: u64,
    /// Entries dropped because their TTL passed (lazy or swept).
    pub expired_evictions: u64,
}

#[derive(Default)]
struct LocalStore {
    flags: DashMap<String, CacheEntry<Arc<CachedFlag>>>,
    overrides: DashMap<OverrideKey, CacheEntry<Arc<CachedOverride>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    expired_evictions: AtomicU64,
}

impl LocalStore {
    fn lookup<K, Q, V>(&self, map: &DashMap<K, CacheEntry<Arc<V>>>, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q> + Hash + Eq,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();

        if let Some(entry) = map.get(key) {
            if !entry.is_expired_at(now) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(Arc::clone(&entry.value));
            }
            // Entry expired; only remove it if no writer refreshed it meanwhile
            drop(entry);
            if map.remove_if(key, |_, e| e.is_expired_at(now)).is_some() {
                self.expired_evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;

        self.flags.retain(|_, entry| {
            let keep = !entry.is_expired_at(now);
            removed += usize::from(!keep);
            keep
        });
        self.overrides.retain(|_, entry| {
            let keep = !entry.is_expired_at(now);
            removed += usize::from(!keep);
            keep
        });

        if removed > 0 {
            self.expired_evictions
                .fetch_add(removed as u64, Ordering::Relaxed);
        }
        removed
    }
}

/// In-process L1 cache with per-entry TTL and a background expiry sweep.
///
/// The sweep task is spawned on the current tokio runtime at construction. When
/// constructed outside a runtime the cache still works; expired entries are then
/// only removed on access.
pub struct LocalFlagCache {
    store: Arc<LocalStore>,
    config: CacheConfig,
    shutdown: Option<watch::Sender<bool>>,
    closed: AtomicBool,
}

impl LocalFlagCache {
    pub fn new(config: CacheConfig) -> Self {
        let config = config.normalized();
        let store = Arc::new(LocalStore::default());
        let shutdown = spawn_sweeper(Arc::downgrade(&store), config.sweep_interval());

        Self {
            store,
            config,
            shutdown,
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Number of (flag, override) entries currently held.
    pub fn count(&self) -> (usize, usize) {
        (self.store.flags.len(), self.store.overrides.len())
    }

    /// Hit and miss counters.
    pub fn get_stats(&self) -> (u64, u64) {
        (
            self.store.hits.load(Ordering::Relaxed),
            self.store.misses.load(Ordering::Relaxed),
        )
    }

    pub fn stats(&self) -> LocalCacheStats {
        let (flags, overrides) = self.count();
        let (hits, misses) = self.get_stats();
        LocalCacheStats {
            flags,
            overrides,
            hits,
            misses,
            expired_evictions: self.store.expired_evictions.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        self.store.hits.store(0, Ordering::Relaxed);
        self.store.misses.store(0, Ordering::Relaxed);
        self.store.expired_evictions.store(0, Ordering::Relaxed);
    }

    /// Remove expired entries now. Returns the number removed.
    pub fn cleanup_expired(&self) -> usize {
        self.store.cleanup_expired()
    }

    /// Drop a flag entry. Returns whether it was present.
    pub fn evict(&self, key: &str) -> bool {
        self.store.flags.remove(key).is_some()
    }

    /// Drop an override entry. Returns whether it was present.
    pub fn evict_override(&self, key: &OverrideKey) -> bool {
        self.store.overrides.remove(key).is_some()
    }

    /// Drop every flag and override entry.
    pub fn clear(&self) {
        self.store.flags.clear();
        self.store.overrides.clear();
    }

    fn effective_ttl(&self, ttl: Duration) -> Duration {
        if ttl.is_zero() {
            self.config.l1_ttl()
        } else {
            ttl
        }
    }
}

#[async_trait]
impl FlagCache for LocalFlagCache {
    async fn get(&self, key: &str) -> CacheResult<Option<Arc<CachedFlag>>> {
        Ok(self.store.lookup(&self.store.flags, key))
    }

    async fn set(&self, key: &str, flag: Arc<CachedFlag>, ttl: Duration) -> CacheResult<()> {
        if flag.is_empty() {
            tracing::debug!(key = %key, "ignoring empty flag snapshot (L1)");
            return Ok(());
        }
        let ttl = self.effective_ttl(ttl);
        self.store
            .flags
            .insert(key.to_string(), CacheEntry::new(flag, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.evict(key);
        Ok(())
    }

    async fn get_override(&self, key: &OverrideKey) -> CacheResult<Option<Arc<CachedOverride>>> {
        Ok(self.store.lookup(&self.store.overrides, key))
    }

    async fn set_override(
        &self,
        flag_override: Arc<CachedOverride>,
        ttl: Duration,
    ) -> CacheResult<()> {
        if flag_override.is_empty() {
            tracing::debug!(key = %flag_override.key, "ignoring empty override snapshot (L1)");
            return Ok(());
        }
        let ttl = self.effective_ttl(ttl);
        let key = flag_override.key.clone();
        self.store
            .overrides
            .insert(key, CacheEntry::new(flag_override, ttl));
        Ok(())
    }

    async fn delete_override(&self, key: &OverrideKey) -> CacheResult<()> {
        self.evict_override(key);
        Ok(())
    }

    async fn invalidate_all(&self) -> CacheResult<()> {
        self.clear();
        Ok(())
    }

    async fn close(&self) -> CacheResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(ref tx) = self.shutdown {
            let _ = tx.send(true);
        }
        tracing::debug!("L1 flag cache closed");
        Ok(())
    }
}

/// Spawn the periodic expiry sweep.
///
/// The task holds only a weak reference to the store and exits when the cache
/// is closed or dropped.
fn spawn_sweeper(store: Weak<LocalStore>, every: Duration) -> Option<watch::Sender<bool>> {
    let handle = match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle,
        Err(_) => {
            tracing::warn!("no tokio runtime, L1 expiry sweep disabled (lazy expiry only)");
            return None;
        }
    };

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    handle.spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(store) = store.upgrade() else {
                        break;
                    };
                    let removed = store.cleanup_expired();
                    if removed > 0 {
                        tracing::debug!(removed, "swept expired L1 entries");
                    }
                    crate::metrics::set_cache_entries("flag", store.flags.len());
                    crate::metrics::set_cache_entries("override", store.overrides.len());
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::debug!("L1 expiry sweep stopped");
    });

    Some(shutdown_tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn test_flag(key: &str) -> Arc<CachedFlag> {
        Arc::new(CachedFlag::new(key, json!({"enabled": true, "type": "boolean"})))
    }

    fn test_override(key: OverrideKey) -> Arc<CachedOverride> {
        Arc::new(CachedOverride::new(key, json!({"value": false})))
    }

    fn cache_with(l1_ttl_ms: u64, sweep_interval_ms: u64) -> LocalFlagCache {
        LocalFlagCache::new(CacheConfig {
            l1_ttl_ms,
            sweep_interval_ms,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_get_miss_and_hit() {
        let cache = LocalFlagCache::new(CacheConfig::default());

        assert!(cache.get("test-flag").await.unwrap().is_none());

        cache
            .set("test-flag", test_flag("test-flag"), Duration::from_secs(5))
            .await
            .unwrap();

        let flag = cache.get("test-flag").await.unwrap().expect("cached flag");
        assert_eq!(flag.key, "test-flag");
        assert_eq!(cache.count(), (1, 0));
    }

    #[tokio::test]
    async fn test_set_empty_snapshot_is_noop() {
        let cache = LocalFlagCache::new(CacheConfig::default());

        cache
            .set(
                "nil-flag",
                Arc::new(CachedFlag::new("nil-flag", serde_json::Value::Null)),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        cache
            .set_override(
                Arc::new(CachedOverride::new(
                    OverrideKey::user("nil-flag", Uuid::new_v4()),
                    serde_json::Value::Null,
                )),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert_eq!(cache.count(), (0, 0));
    }

    #[tokio::test]
    async fn test_delete() {
        let cache = LocalFlagCache::new(CacheConfig::default());
        cache
            .set("test-flag", test_flag("test-flag"), Duration::from_secs(5))
            .await
            .unwrap();

        cache.delete("test-flag").await.unwrap();
        assert!(cache.get("test-flag").await.unwrap().is_none());

        // Deleting an absent key is fine
        cache.delete("never-set").await.unwrap();
    }

    #[tokio::test]
    async fn test_expiration() {
        let cache = LocalFlagCache::new(CacheConfig::default());
        cache
            .set("test-flag", test_flag("test-flag"), Duration::from_millis(50))
            .await
            .unwrap();
        assert!(cache.get("test-flag").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(cache.get("test-flag").await.unwrap().is_none());
        let stats = cache.stats();
        assert_eq!(stats.flags, 0);
        assert_eq!(stats.expired_evictions, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_default_ttl_applies_to_zero() {
        let cache = cache_with(100, 30_000);
        cache
            .set("test-flag", test_flag("test-flag"), Duration::ZERO)
            .await
            .unwrap();
        assert!(cache.get("test-flag").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(cache.get("test-flag").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_override_identity() {
        let cache = LocalFlagCache::new(CacheConfig::default());
        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();

        cache
            .set_override(test_override(OverrideKey::user("promo", u1)), Duration::from_secs(5))
            .await
            .unwrap();

        let hit = cache
            .get_override(&OverrideKey::user("promo", u1))
            .await
            .unwrap()
            .expect("override for u1");
        assert_eq!(hit.key.target_id, u1);

        assert!(
            cache
                .get_override(&OverrideKey::user("promo", u2))
                .await
                .unwrap()
                .is_none()
        );
        // Same id, different target type is a different entry
        assert!(
            cache
                .get_override(&OverrideKey::tenant("promo", u1))
                .await
                .unwrap()
                .is_none()
        );

        cache
            .delete_override(&OverrideKey::user("promo", u1))
            .await
            .unwrap();
        assert_eq!(cache.count(), (0, 0));
    }

    #[tokio::test]
    async fn test_invalidate_all() {
        let cache = LocalFlagCache::new(CacheConfig::default());
        for key in ["flag-1", "flag-2"] {
            cache.set(key, test_flag(key), Duration::from_secs(5)).await.unwrap();
        }
        cache
            .set_override(
                test_override(OverrideKey::user("flag-1", Uuid::new_v4())),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        cache
            .set_override(
                test_override(OverrideKey::tenant("flag-2", Uuid::new_v4())),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(cache.count(), (2, 2));

        cache.invalidate_all().await.unwrap();
        assert_eq!(cache.count(), (0, 0));
    }

    #[tokio::test]
    async fn test_stats_and_reset() {
        let cache = LocalFlagCache::new(CacheConfig::default());
        assert_eq!(cache.get_stats(), (0, 0));

        let _ = cache.get("test-flag").await;
        assert_eq!(cache.get_stats(), (0, 1));

        cache
            .set("test-flag", test_flag("test-flag"), Duration::from_secs(5))
            .await
            .unwrap();
        let _ = cache.get("test-flag").await;
        assert_eq!(cache.get_stats(), (1, 1));

        cache.reset_stats();
        assert_eq!(cache.get_stats(), (0, 0));

        let _ = cache.get("test-flag").await;
        let _ = cache.get("test-flag").await;
        let _ = cache.get("other").await;
        assert_eq!(cache.get_stats(), (2, 1));
    }

    #[tokio::test]
    async fn test_background_sweep_removes_expired() {
        let cache = cache_with(60_000, 20);
        cache
            .set("short", test_flag("short"), Duration::from_millis(10))
            .await
            .unwrap();
        cache
            .set("long", test_flag("long"), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.count(), (2, 0));

        tokio::time::sleep(Duration::from_millis(120)).await;

        // Removed without any read touching the key
        assert_eq!(cache.count(), (1, 0));
        assert_eq!(cache.stats().expired_evictions, 1);
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let cache = LocalFlagCache::new(CacheConfig::default());
        for i in 0..3 {
            let key = format!("flag-{i}");
            cache
                .set(&key, test_flag(&key), Duration::from_millis(10))
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(cache.cleanup_expired(), 3);
        assert_eq!(cache.count(), (0, 0));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let cache = LocalFlagCache::new(CacheConfig::default());
        cache.close().await.unwrap();
        cache.close().await.unwrap();

        // Still usable after close, only the sweep is gone
        cache
            .set("test-flag", test_flag("test-flag"), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(cache.get("test-flag").await.unwrap().is_some());
    }

    #[test]
    fn test_works_without_runtime() {
        let cache = LocalFlagCache::new(CacheConfig::default());
        assert!(cache.shutdown.is_none());
        assert!(!cache.evict("missing"));
        assert_eq!(cache.count(), (0, 0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_set_get_same_key() {
        let cache = Arc::new(LocalFlagCache::new(CacheConfig::default()));
        let mut tasks = Vec::new();

        for writer in 0..16u64 {
            let cache = Arc::clone(&cache);
            tasks.push(tokio::spawn(async move {
                for seq in 0..200u64 {
                    let flag = Arc::new(CachedFlag::new(
                        "shared",
                        json!({"writer": writer, "seq": seq}),
                    ));
                    cache.set("shared", flag, Duration::from_secs(5)).await.unwrap();

                    if let Some(seen) = cache.get("shared").await.unwrap() {
                        assert_eq!(seen.key, "shared");
                        assert!(seen.payload["writer"].is_u64());
                        assert!(seen.payload["seq"].is_u64());
                    }
                }
            }));
        }

        for task in tasks {
            task.await.expect("task panicked");
        }

        assert_eq!(cache.count(), (1, 0));
        let (hits, misses) = cache.get_stats();
        assert_eq!(hits + misses, 16 * 200);
    }
}
