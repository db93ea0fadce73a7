//! Subscription lifecycle and handler dispatch shared by invalidation channels.
//!
//! Each channel owns one [`SubscriptionLifecycle`]. `subscribe` obtains a
//! [`SubscriptionGuard`] from it; the guard carries the cancellation token the
//! receive loop selects on and signals completion when dropped, so `close` can
//! wait for the loop to actually finish.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, oneshot};
use tokio_util::sync::CancellationToken;

use super::pubsub::InvalidationHandler;
use super::types::CacheUpdateMessage;
use crate::error::{CacheError, CacheResult};

/// Observable state of an invalidation subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Idle,
    Subscribing,
    Running,
    Stopping,
    Stopped,
}

impl SubscriptionState {
    fn is_active(self) -> bool {
        matches!(self, Self::Subscribing | Self::Running | Self::Stopping)
    }
}

struct Inner {
    state: SubscriptionState,
    cancel: Option<CancellationToken>,
    done: Option<oneshot::Receiver<()>>,
}

pub(crate) struct SubscriptionLifecycle {
    inner: Mutex<Inner>,
    closed: AtomicBool,
}

impl Default for SubscriptionLifecycle {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: SubscriptionState::Idle,
                cancel: None,
                done: None,
            }),
            closed: AtomicBool::new(false),
        }
    }
}

impl SubscriptionLifecycle {
    pub(crate) fn state(&self) -> SubscriptionState {
        self.inner.lock().state
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Claim the single subscription slot.
    pub(crate) fn begin(&self) -> CacheResult<SubscriptionGuard<'_>> {
        let mut inner = self.inner.lock();
        // Checked under the lock so close() either sees our token or we see closed
        if self.is_closed() {
            return Err(CacheError::Closed);
        }
        if inner.state.is_active() {
            return Err(CacheError::AlreadyRunning);
        }

        let token = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();
        inner.state = SubscriptionState::Subscribing;
        inner.cancel = Some(token.clone());
        inner.done = Some(done_rx);

        Ok(SubscriptionGuard {
            lifecycle: self,
            token,
            done: Some(done_tx),
        })
    }

    /// Cancel the running subscription and wait (bounded) for it to finish.
    ///
    /// Returns `false` when the lifecycle was already closed.
    pub(crate) async fn close(&self, timeout: Duration) -> bool {
        let (token, done) = {
            let mut inner = self.inner.lock();
            if self.closed.swap(true, Ordering::AcqRel) {
                return false;
            }
            match inner.state {
                SubscriptionState::Subscribing | SubscriptionState::Running => {
                    inner.state = SubscriptionState::Stopping;
                }
                SubscriptionState::Idle => inner.state = SubscriptionState::Stopped,
                SubscriptionState::Stopping | SubscriptionState::Stopped => {}
            }
            (inner.cancel.take(), inner.done.take())
        };

        if let Some(token) = token {
            token.cancel();
        }
        if let Some(done) = done {
            if tokio::time::timeout(timeout, done).await.is_err() {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "invalidation subscription did not stop in time"
                );
            }
        }
        true
    }
}

/// Held by a running `subscribe` call. Dropping it marks the subscription
/// stopped, whether the loop returned normally or its future was dropped.
pub(crate) struct SubscriptionGuard<'a> {
    lifecycle: &'a SubscriptionLifecycle,
    token: CancellationToken,
    done: Option<oneshot::Sender<()>>,
}

impl SubscriptionGuard<'_> {
    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn mark_running(&self) {
        let mut inner = self.lifecycle.inner.lock();
        if inner.state == SubscriptionState::Subscribing {
            inner.state = SubscriptionState::Running;
        }
    }
}

impl Drop for SubscriptionGuard<'_> {
    fn drop(&mut self) {
        {
            let mut inner = self.lifecycle.inner.lock();
            inner.state = SubscriptionState::Stopped;
            inner.cancel = None;
        }
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

/// Runs invalidation handlers off the receive loop.
///
/// At most `max_inflight` handlers run at once; when all permits are taken the
/// receive loop waits, which applies backpressure to the transport instead of
/// spawning without bound. A panicking handler is logged and does not affect
/// the loop or other handlers.
pub(crate) struct HandlerDispatcher {
    permits: Arc<Semaphore>,
}

impl HandlerDispatcher {
    pub(crate) fn new(max_inflight: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_inflight.max(1))),
        }
    }

    pub(crate) async fn dispatch(&self, handler: &InvalidationHandler, msg: CacheUpdateMessage) {
        let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
            return;
        };
        let handler = Arc::clone(handler);

        tokio::spawn(async move {
            let _permit = permit;
            let action = msg.action;
            let flag_key = msg.flag_key.clone();

            if AssertUnwindSafe(async move { handler(msg) })
                .catch_unwind()
                .await
                .is_err()
            {
                tracing::error!(
                    action = %action,
                    flag_key = %flag_key,
                    "invalidation handler panicked"
                );
            }
        });
    }
}
