//! Integration tests against a real Redis.
//!
//! Tests use testcontainers to spin up one Redis instance shared by the whole
//! file. Every test works in its own logical database and on its own Pub/Sub
//! channel, so they can run in parallel. When no container runtime is available
//! the tests log a notice and return early.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use erp_flagcache::cache::SubscriptionState;
use erp_flagcache::cache::pubsub::InvalidationHandler;
use erp_flagcache::cache::shared::{create_pool, flag_key, verify_pool};
use erp_flagcache::{
    AppConfig, CacheConfig, CacheError, CacheUpdateAction, CacheUpdateMessage, CachedFlag,
    CachedOverride, ConnectionOwnership, FlagCache, InvalidationChannel, OverrideKey,
    RedisConfig, RedisFlagCache, RedisFlagCacheInvalidator, connect_tiered_cache,
};
use redis::AsyncCommands;
use serde_json::json;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::{OnceCell, mpsc};
use uuid::Uuid;

// Shared Redis container for all tests
static SHARED_REDIS: OnceCell<Option<(ContainerAsync<Redis>, u16)>> = OnceCell::const_new();

// Database 0 is left alone
static NEXT_DB: AtomicU8 = AtomicU8::new(1);

/// Connection settings for a fresh logical database, or `None` without Docker.
async fn test_redis() -> Option<RedisConfig> {
    let shared = SHARED_REDIS
        .get_or_init(|| async {
            let container = match Redis::default().start().await {
                Ok(container) => container,
                Err(e) => {
                    eprintln!("skipping Redis integration tests: {e}");
                    return None;
                }
            };
            let port = container.get_host_port_ipv4(6379).await.ok()?;
            Some((container, port))
        })
        .await;

    let (_, port) = shared.as_ref()?;
    Some(RedisConfig {
        host: "127.0.0.1".into(),
        port: *port,
        db: NEXT_DB.fetch_add(1, Ordering::SeqCst),
        pool_size: 4,
        timeout_ms: 2_000,
        ..Default::default()
    })
}

macro_rules! redis_or_skip {
    () => {
        match test_redis().await {
            Some(redis) => redis,
            None => return,
        }
    };
}

fn cache_config() -> CacheConfig {
    CacheConfig {
        invalidation_channel: format!("feature_flag:invalidate:{}", Uuid::new_v4()),
        ..Default::default()
    }
}

fn flag(key: &str, version: u64) -> Arc<CachedFlag> {
    Arc::new(CachedFlag::new(key, json!({"enabled": true, "version": version})))
}

async fn key_exists(redis: &RedisConfig, key: &str) -> bool {
    let pool = create_pool(redis).expect("pool");
    let mut conn = pool.get().await.expect("connection");
    conn.exists(key).await.expect("EXISTS")
}

async fn wait_running(channel: &dyn InvalidationChannel) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while channel.state() != SubscriptionState::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("subscription running");
}

#[tokio::test]
async fn test_flag_get_set_delete() {
    let redis = redis_or_skip!();
    let cache = RedisFlagCache::connect(&redis, cache_config())
        .await
        .expect("connect");

    assert!(cache.get("checkout").await.unwrap().is_none());

    cache
        .set("checkout", flag("checkout", 1), Duration::from_secs(60))
        .await
        .unwrap();
    let stored = cache.get("checkout").await.unwrap().expect("stored");
    assert_eq!(stored.payload["version"], 1);
    assert!(key_exists(&redis, "feature_flag:checkout").await);

    cache.delete("checkout").await.unwrap();
    assert!(cache.get("checkout").await.unwrap().is_none());

    // Empty snapshots are never written
    cache
        .set(
            "nil",
            Arc::new(CachedFlag::new("nil", serde_json::Value::Null)),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
    assert!(!key_exists(&redis, "feature_flag:nil").await);

    cache.close().await.unwrap();
}

#[tokio::test]
async fn test_override_identity() {
    let redis = redis_or_skip!();
    let cache = RedisFlagCache::connect(&redis, cache_config())
        .await
        .expect("connect");

    let u1 = OverrideKey::user("promo", Uuid::new_v4());
    let u2 = OverrideKey::user("promo", Uuid::new_v4());
    cache
        .set_override(
            Arc::new(CachedOverride::new(u1.clone(), json!({"value": "beta"}))),
            Duration::from_secs(60),
        )
        .await
        .unwrap();

    let hit = cache.get_override(&u1).await.unwrap().expect("override");
    assert_eq!(hit.key, u1);
    assert!(cache.get_override(&u2).await.unwrap().is_none());

    let raw_key = format!("feature_flag:override:promo:user:{}", u1.target_id);
    assert!(key_exists(&redis, &raw_key).await);

    cache.delete_override(&u1).await.unwrap();
    assert!(!key_exists(&redis, &raw_key).await);

    cache.close().await.unwrap();
}

#[tokio::test]
async fn test_ttl_expiry_and_defaults() {
    let redis = redis_or_skip!();
    let cache = RedisFlagCache::connect(&redis, cache_config())
        .await
        .expect("connect");

    cache
        .set("short", flag("short", 1), Duration::from_millis(200))
        .await
        .unwrap();
    assert!(cache.get("short").await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(cache.get("short").await.unwrap().is_none());

    // Zero TTL falls back to the flag TTL (5 minutes)
    cache
        .set("default", flag("default", 1), Duration::ZERO)
        .await
        .unwrap();
    let remaining = cache
        .flag_ttl_remaining("default")
        .await
        .unwrap()
        .expect("ttl set");
    assert!(remaining > Duration::from_secs(290));
    assert!(remaining <= Duration::from_secs(300));

    cache.close().await.unwrap();
}

#[tokio::test]
async fn test_corrupted_payload_is_removed() {
    let redis = redis_or_skip!();
    let cache = RedisFlagCache::connect(&redis, cache_config())
        .await
        .expect("connect");

    {
        let mut conn = cache.pool().get().await.unwrap();
        let _: () = conn.set(flag_key("broken"), "{not json").await.unwrap();
    }

    match cache.get("broken").await {
        Err(CacheError::Deserialization { key, .. }) => assert_eq!(key, "feature_flag:broken"),
        other => panic!("expected deserialization error, got {other:?}"),
    }
    assert!(!key_exists(&redis, "feature_flag:broken").await);

    // Exactly one error: the next read is a plain miss
    assert!(cache.get("broken").await.unwrap().is_none());

    cache.close().await.unwrap();
}

#[tokio::test]
async fn test_invalidate_all_scans_in_batches() {
    let redis = redis_or_skip!();
    let cache = RedisFlagCache::connect(
        &redis,
        CacheConfig {
            scan_batch_size: 20,
            ..cache_config()
        },
    )
    .await
    .expect("connect");

    for i in 0..150 {
        let key = format!("flag-{i}");
        cache
            .set(&key, flag(&key, 1), Duration::from_secs(60))
            .await
            .unwrap();
    }
    for _ in 0..30 {
        cache
            .set_override(
                Arc::new(CachedOverride::new(
                    OverrideKey::tenant("flag-1", Uuid::new_v4()),
                    json!(true),
                )),
                Duration::from_secs(60),
            )
            .await
            .unwrap();
    }
    {
        let mut conn = cache.pool().get().await.unwrap();
        let _: () = conn.set("unrelated:key", "keep").await.unwrap();
    }

    cache.invalidate_all().await.unwrap();

    let mut conn = cache.pool().get().await.unwrap();
    let remaining: Vec<String> = conn.keys("feature_flag:*").await.unwrap();
    assert!(remaining.is_empty(), "left behind: {remaining:?}");
    let kept: bool = conn.exists("unrelated:key").await.unwrap();
    assert!(kept);
    drop(conn);

    cache.close().await.unwrap();
}

#[tokio::test]
async fn test_owned_pool_closed_once() {
    let redis = redis_or_skip!();
    let cache = RedisFlagCache::connect(&redis, cache_config())
        .await
        .expect("connect");
    assert_eq!(cache.ownership(), ConnectionOwnership::Owned);

    cache.close().await.unwrap();
    cache.close().await.unwrap();

    assert!(cache.pool().is_closed());
    assert!(cache.get("anything").await.unwrap_err().is_transport());
}

#[tokio::test]
async fn test_borrowed_pool_stays_open() {
    let redis = redis_or_skip!();
    let pool = create_pool(&redis).unwrap();
    verify_pool(&pool).await.unwrap();

    let cache = RedisFlagCache::new(pool.clone(), cache_config(), ConnectionOwnership::Borrowed);
    let invalidator =
        RedisFlagCacheInvalidator::from_pool(pool.clone(), &redis, cache_config()).unwrap();

    cache.close().await.unwrap();
    cache.close().await.unwrap();
    invalidator.close().await.unwrap();
    invalidator.close().await.unwrap();

    assert!(!pool.is_closed());
    verify_pool(&pool).await.unwrap();
}

#[tokio::test]
async fn test_publish_subscribe_round_trip() {
    let redis = redis_or_skip!();
    let config = cache_config();
    let subscriber = Arc::new(
        RedisFlagCacheInvalidator::connect(&redis, config.clone())
            .await
            .expect("subscriber"),
    );
    let publisher = RedisFlagCacheInvalidator::connect(&redis, config)
        .await
        .expect("publisher");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler: InvalidationHandler = Arc::new(move |msg: CacheUpdateMessage| {
        let _ = tx.send(msg);
    });

    let task = {
        let subscriber = Arc::clone(&subscriber);
        let handler = Arc::clone(&handler);
        tokio::spawn(async move { subscriber.subscribe(handler).await })
    };
    wait_running(subscriber.as_ref()).await;

    // A second subscription on the same instance is rejected
    assert!(matches!(
        subscriber.subscribe(handler).await,
        Err(CacheError::AlreadyRunning)
    ));

    let target = OverrideKey::tenant("billing", Uuid::new_v4());
    publisher.publish_override_update(&target).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("message in time")
        .expect("handler alive");
    assert_eq!(received.action, CacheUpdateAction::OverrideUpdated);
    assert_eq!(received.flag_key, "billing");
    assert_eq!(received.target_type, "tenant");
    assert_eq!(received.target_id, target.target_id.to_string());
    assert!(received.timestamp > 0);

    subscriber.close().await.unwrap();
    subscriber.close().await.unwrap();
    assert!(task.await.unwrap().is_ok());
    assert_eq!(subscriber.state(), SubscriptionState::Stopped);

    publisher.close().await.unwrap();
}

#[tokio::test]
async fn test_tiered_replicas_over_redis() {
    let redis = redis_or_skip!();
    let config = AppConfig {
        cache: cache_config(),
        redis,
        ..Default::default()
    };

    let a = connect_tiered_cache(&config).await.expect("replica a");
    let b = connect_tiered_cache(&config).await.expect("replica b");
    let a_listener = a.spawn_invalidation_listener();
    let b_listener = b.spawn_invalidation_listener();
    for cache in [&a, &b] {
        let channel = cache.invalidator().expect("invalidator");
        wait_running(channel.as_ref()).await;
    }

    a.set("checkout-v2", flag("checkout-v2", 1), Duration::from_secs(60))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let seen = b.get("checkout-v2").await.unwrap().expect("from L2");
    assert_eq!(seen.payload["version"], 1);
    assert!(b.get_l1("checkout-v2").await.unwrap().is_some());

    a.set("checkout-v2", flag("checkout-v2", 2), Duration::from_secs(60))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while b.get_l1("checkout-v2").await.unwrap().is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("B evicted its L1 copy");

    let fresh = b.get("checkout-v2").await.unwrap().expect("refetched");
    assert_eq!(fresh.payload["version"], 2);
    assert!(b.is_shared_tier_available().await);

    a.close().await.unwrap();
    b.close().await.unwrap();
    assert!(a_listener.await.unwrap().is_ok());
    assert!(b_listener.await.unwrap().is_ok());
}
