//! Redis Pub/Sub for cross-instance L1 invalidation.
//!
//! ## How It Works
//!
//! 1. A writer changes a flag and publishes a [`CacheUpdateMessage`] as JSON on
//!    the invalidation channel (default `feature_flag:invalidate`)
//! 2. Every instance runs one subscription on that channel
//! 3. Each received message is handed to the registered handler, which evicts
//!    the matching L1 entries
//!
//! ```text
//! Instance 1: cache.set("checkout-v2")
//!   ↓
//! Redis Pub/Sub: PUBLISH feature_flag:invalidate {"action":"updated",...}
//!   ↓
//! Instance 2: handler → L1 evict "checkout-v2"
//! Instance 3: handler → L1 evict "checkout-v2"
//! ```
//!
//! Delivery is best-effort: a subscriber that is disconnected while a message
//! is published never sees it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::Pool;
use futures_util::StreamExt;
use redis::AsyncCommands;

use super::shared::{ConnectionOwnership, create_pool, verify_pool};
use super::subscription::{HandlerDispatcher, SubscriptionLifecycle, SubscriptionState};
use super::types::{CacheUpdateMessage, OverrideKey};
use crate::config::{CacheConfig, RedisConfig};
use crate::error::{CacheError, CacheResult};

/// Callback invoked for each received invalidation message.
///
/// Handlers run on spawned tasks; a panic is logged and contained.
pub type InvalidationHandler = Arc<dyn Fn(CacheUpdateMessage) + Send + Sync>;

/// Publish/subscribe channel carrying cache invalidation messages.
#[async_trait]
pub trait InvalidationChannel: Send + Sync {
    /// Stamp (if unset), encode and send a message to every subscriber.
    async fn publish(&self, msg: CacheUpdateMessage) -> CacheResult<()>;

    /// Receive messages until the channel is closed.
    ///
    /// Only one subscription may be active per channel; a second concurrent call
    /// fails with [`CacheError::AlreadyRunning`]. Returns `Ok(())` when stopped by
    /// [`InvalidationChannel::close`] and an error when the transport goes away.
    async fn subscribe(&self, handler: InvalidationHandler) -> CacheResult<()>;

    fn state(&self) -> SubscriptionState;

    /// Stop the subscription, wait for it (bounded) and release owned resources.
    async fn close(&self) -> CacheResult<()>;

    async fn publish_flag_update(&self, flag_key: &str) -> CacheResult<()> {
        self.publish(CacheUpdateMessage::flag_updated(flag_key)).await
    }

    async fn publish_flag_delete(&self, flag_key: &str) -> CacheResult<()> {
        self.publish(CacheUpdateMessage::flag_deleted(flag_key)).await
    }

    async fn publish_override_update(&self, key: &OverrideKey) -> CacheResult<()> {
        self.publish(CacheUpdateMessage::override_updated(key)).await
    }

    async fn publish_override_delete(&self, key: &OverrideKey) -> CacheResult<()> {
        self.publish(CacheUpdateMessage::override_deleted(key)).await
    }

    async fn publish_invalidate_all(&self) -> CacheResult<()> {
        self.publish(CacheUpdateMessage::invalidate_all()).await
    }
}

/// Invalidation channel backed by Redis Pub/Sub.
///
/// Publishing goes through the shared pool. The subscription uses a dedicated
/// connection opened from `client`, since a connection in subscriber mode cannot
/// run regular commands.
pub struct RedisFlagCacheInvalidator {
    pool: Pool,
    client: redis::Client,
    channel: String,
    ownership: ConnectionOwnership,
    lifecycle: SubscriptionLifecycle,
    dispatcher: HandlerDispatcher,
    close_timeout: Duration,
}

impl RedisFlagCacheInvalidator {
    /// Connect with a pool of its own, closed again by `close`.
    pub async fn connect(redis: &RedisConfig, config: CacheConfig) -> CacheResult<Self> {
        let pool = create_pool(redis)?;
        verify_pool(&pool).await?;
        let client = redis::Client::open(redis.connection_url())?;
        Ok(Self::new(pool, client, config, ConnectionOwnership::Owned))
    }

    /// Publish through a caller-owned pool; `close` leaves it open.
    pub fn from_pool(pool: Pool, redis: &RedisConfig, config: CacheConfig) -> CacheResult<Self> {
        let client = redis::Client::open(redis.connection_url())?;
        Ok(Self::new(pool, client, config, ConnectionOwnership::Borrowed))
    }

    pub fn new(
        pool: Pool,
        client: redis::Client,
        config: CacheConfig,
        ownership: ConnectionOwnership,
    ) -> Self {
        let config = config.normalized();
        Self {
            pool,
            client,
            channel: config.invalidation_channel.clone(),
            ownership,
            lifecycle: SubscriptionLifecycle::default(),
            dispatcher: HandlerDispatcher::new(config.max_inflight_handlers),
            close_timeout: config.close_timeout(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    async fn open_subscription(&self) -> CacheResult<redis::aio::PubSub> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| CacheError::Subscribe(format!("failed to get pub/sub connection: {e}")))?;

        pubsub
            .subscribe(&self.channel)
            .await
            .map_err(|e| CacheError::Subscribe(format!("failed to subscribe: {e}")))?;

        Ok(pubsub)
    }
}

#[async_trait]
impl InvalidationChannel for RedisFlagCacheInvalidator {
    async fn publish(&self, mut msg: CacheUpdateMessage) -> CacheResult<()> {
        if self.lifecycle.is_closed() {
            return Err(CacheError::Closed);
        }
        msg.stamp();
        let payload = msg.encode()?;

        let mut conn = self.pool.get().await?;
        let receivers: i64 = conn
            .publish(&self.channel, payload)
            .await
            .map_err(|e| CacheError::Publish(e.to_string()))?;

        tracing::debug!(
            action = %msg.action,
            flag_key = %msg.flag_key,
            receivers,
            "published cache invalidation"
        );
        Ok(())
    }

    async fn subscribe(&self, handler: InvalidationHandler) -> CacheResult<()> {
        let guard = self.lifecycle.begin()?;

        let mut pubsub = tokio::select! {
            _ = guard.token().cancelled() => return Ok(()),
            opened = self.open_subscription() => opened?,
        };
        guard.mark_running();
        tracing::info!(channel = %self.channel, "subscribed to feature flag invalidations");

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                biased;
                _ = guard.token().cancelled() => {
                    tracing::debug!(channel = %self.channel, "invalidation subscription cancelled");
                    return Ok(());
                }
                next = stream.next() => {
                    let Some(msg) = next else {
                        tracing::warn!(channel = %self.channel, "pub/sub connection closed");
                        return Err(CacheError::ChannelClosed);
                    };

                    let payload: String = match msg.get_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to read invalidation payload");
                            continue;
                        }
                    };

                    match CacheUpdateMessage::decode(&payload) {
                        Ok(update) => self.dispatcher.dispatch(&handler, update).await,
                        Err(e) => {
                            tracing::warn!(error = %e, payload = %payload, "skipping malformed invalidation message");
                        }
                    }
                }
            }
        }
    }

    fn state(&self) -> SubscriptionState {
        self.lifecycle.state()
    }

    async fn close(&self) -> CacheResult<()> {
        if !self.lifecycle.close(self.close_timeout).await {
            return Ok(());
        }
        if self.ownership == ConnectionOwnership::Owned {
            self.pool.close();
        }
        tracing::debug!(channel = %self.channel, "invalidation channel closed");
        Ok(())
    }
}
