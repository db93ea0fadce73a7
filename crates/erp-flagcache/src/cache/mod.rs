//! Two-tier feature flag cache for horizontal scaling.
//!
//! ## Architecture
//!
//! - **L1 Cache (DashMap)**: In-memory, microsecond latency, per-instance
//! - **L2 Cache (Redis)**: Network, millisecond latency, shared across instances
//! - **Pub/Sub**: Cross-instance L1 invalidation
//!
//! ## Cache Hierarchy
//!
//! ```text
//! GET → L1 (DashMap) → L2 (Redis) → miss, caller consults the flag repository
//!
//! SET → L2 (Redis) → L1 (own instance) → PUBLISH → other instances evict L1
//! ```
//!
//! ## Consistency
//!
//! Invalidation is best-effort and at-most-once per connected subscriber. An
//! instance that misses a message serves its stale L1 copy until the L1 TTL
//! expires, so staleness is bounded by `l1_ttl`.

pub mod bus;
pub mod local;
pub mod pubsub;
pub mod shared;
pub mod subscription;
pub mod tiered;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CacheResult;

pub use bus::{InProcessBroker, LocalInvalidationChannel};
pub use local::{LocalCacheStats, LocalFlagCache};
pub use pubsub::{InvalidationChannel, InvalidationHandler, RedisFlagCacheInvalidator};
pub use shared::{ConnectionOwnership, RedisFlagCache};
pub use subscription::SubscriptionState;
pub use tiered::{FlagSource, TieredFlagCache};
pub use types::{
    CacheEntry, CacheStats, CacheUpdateAction, CacheUpdateMessage, CachedFlag, CachedOverride,
    OverrideKey, OverrideTargetType,
};

/// Common contract of every cache tier.
///
/// Misses are `Ok(None)`. A zero `ttl` means "use the tier's default TTL for this
/// value family". Setting an empty snapshot (null payload) is a no-op.
#[async_trait]
pub trait FlagCache: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<Arc<CachedFlag>>>;

    async fn set(&self, key: &str, flag: Arc<CachedFlag>, ttl: Duration) -> CacheResult<()>;

    async fn delete(&self, key: &str) -> CacheResult<()>;

    async fn get_override(&self, key: &OverrideKey) -> CacheResult<Option<Arc<CachedOverride>>>;

    async fn set_override(&self, flag_override: Arc<CachedOverride>, ttl: Duration)
    -> CacheResult<()>;

    async fn delete_override(&self, key: &OverrideKey) -> CacheResult<()>;

    /// Remove every flag and override held by this tier.
    async fn invalidate_all(&self) -> CacheResult<()>;

    /// Check that the tier's backing store answers. In-process tiers always do.
    async fn ping(&self) -> CacheResult<()> {
        Ok(())
    }

    /// Release background tasks and owned connections. Safe to call repeatedly.
    async fn close(&self) -> CacheResult<()>;
}
