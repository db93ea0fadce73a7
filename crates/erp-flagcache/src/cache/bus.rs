//! In-process invalidation broker.
//!
//! Same contract as the Redis channel, carried over a tokio broadcast channel.
//! Useful for single-process deployments and for exercising several cache
//! instances against each other without a Redis server.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use super::pubsub::{InvalidationChannel, InvalidationHandler};
use super::subscription::{HandlerDispatcher, SubscriptionLifecycle, SubscriptionState};
use super::types::CacheUpdateMessage;
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};

/// Default buffer size for the broadcast channel.
/// Subscribers lagging further behind lose the oldest messages.
const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Shared message bus; every [`LocalInvalidationChannel`] created from the same
/// broker (or a clone of it) sees every other one's messages.
#[derive(Clone)]
pub struct InProcessBroker {
    sender: broadcast::Sender<String>,
}

impl Default for InProcessBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessBroker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a channel endpoint attached to this broker.
    pub fn channel(&self, config: &CacheConfig) -> LocalInvalidationChannel {
        let config = config.clone().normalized();
        LocalInvalidationChannel {
            sender: self.sender.clone(),
            lifecycle: SubscriptionLifecycle::default(),
            dispatcher: HandlerDispatcher::new(config.max_inflight_handlers),
            close_timeout: config.close_timeout(),
        }
    }

    /// Send a raw payload, bypassing encoding.
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish_raw(&self, payload: impl Into<String>) -> usize {
        self.sender.send(payload.into()).unwrap_or_default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// One endpoint of an [`InProcessBroker`].
pub struct LocalInvalidationChannel {
    sender: broadcast::Sender<String>,
    lifecycle: SubscriptionLifecycle,
    dispatcher: HandlerDispatcher,
    close_timeout: Duration,
}

#[async_trait]
impl InvalidationChannel for LocalInvalidationChannel {
    async fn publish(&self, mut msg: CacheUpdateMessage) -> CacheResult<()> {
        if self.lifecycle.is_closed() {
            return Err(CacheError::Closed);
        }
        msg.stamp();
        let payload = msg.encode()?;
        // No subscribers is not an error, same as PUBLISH returning 0
        let receivers = self.sender.send(payload).unwrap_or_default();
        tracing::debug!(action = %msg.action, flag_key = %msg.flag_key, receivers, "published cache invalidation");
        Ok(())
    }

    async fn subscribe(&self, handler: InvalidationHandler) -> CacheResult<()> {
        let guard = self.lifecycle.begin()?;
        let mut rx = self.sender.subscribe();
        guard.mark_running();

        loop {
            tokio::select! {
                biased;
                _ = guard.token().cancelled() => return Ok(()),
                received = rx.recv() => match received {
                    Ok(payload) => match CacheUpdateMessage::decode(&payload) {
                        Ok(update) => self.dispatcher.dispatch(&handler, update).await,
                        Err(e) => {
                            tracing::warn!(error = %e, payload = %payload, "skipping malformed invalidation message");
                        }
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "invalidation subscriber lagged, messages dropped");
                    }
                    Err(RecvError::Closed) => return Err(CacheError::ChannelClosed),
                },
            }
        }
    }

    fn state(&self) -> SubscriptionState {
        self.lifecycle.state()
    }

    async fn close(&self) -> CacheResult<()> {
        self.lifecycle.close(self.close_timeout).await;
        Ok(())
    }
}
