//! Values, keys and wire records shared by every cache tier.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::CacheError;

/// Kind of target an override applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrideTargetType {
    User,
    Tenant,
}

impl OverrideTargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Tenant => "tenant",
        }
    }
}

impl fmt::Display for OverrideTargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverrideTargetType {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "tenant" => Ok(Self::Tenant),
            other => Err(CacheError::InvalidMessage(format!(
                "unknown override target type '{other}'"
            ))),
        }
    }
}

/// Composite identity of a cached override: (flag key, target type, target id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OverrideKey {
    pub flag_key: String,
    pub target_type: OverrideTargetType,
    pub target_id: Uuid,
}

impl OverrideKey {
    pub fn new(flag_key: impl Into<String>, target_type: OverrideTargetType, target_id: Uuid) -> Self {
        Self {
            flag_key: flag_key.into(),
            target_type,
            target_id,
        }
    }

    pub fn user(flag_key: impl Into<String>, user_id: Uuid) -> Self {
        Self::new(flag_key, OverrideTargetType::User, user_id)
    }

    pub fn tenant(flag_key: impl Into<String>, tenant_id: Uuid) -> Self {
        Self::new(flag_key, OverrideTargetType::Tenant, tenant_id)
    }
}

impl fmt::Display for OverrideKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.flag_key, self.target_type, self.target_id)
    }
}

/// Snapshot of a feature flag as held by the cache.
///
/// The payload is opaque: the cache stores and returns it without looking inside.
/// A `null` payload marks an empty snapshot and is never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedFlag {
    pub key: String,
    pub payload: serde_json::Value,
}

impl CachedFlag {
    pub fn new(key: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_null()
    }
}

/// Snapshot of a flag override, addressed by its [`OverrideKey`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedOverride {
    pub key: OverrideKey,
    pub payload: serde_json::Value,
}

impl CachedOverride {
    pub fn new(key: OverrideKey, payload: serde_json::Value) -> Self {
        Self { key, payload }
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_null()
    }
}

/// A value with an absolute expiry.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub expires_at: Instant,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, ttl: Duration) -> Self {
        let now = Instant::now();
        let expires_at = now
            .checked_add(ttl)
            .unwrap_or_else(|| now + Duration::from_secs(u32::MAX as u64));
        Self { value, expires_at }
    }

    /// An entry stays servable up to and including its expiry instant.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

/// Change notification carried on the invalidation channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheUpdateAction {
    #[serde(rename = "updated")]
    FlagUpdated,
    #[serde(rename = "deleted")]
    FlagDeleted,
    #[serde(rename = "override_updated")]
    OverrideUpdated,
    #[serde(rename = "override_deleted")]
    OverrideDeleted,
    #[serde(rename = "invalidate_all")]
    InvalidateAll,
}

impl CacheUpdateAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FlagUpdated => "updated",
            Self::FlagDeleted => "deleted",
            Self::OverrideUpdated => "override_updated",
            Self::OverrideDeleted => "override_deleted",
            Self::InvalidateAll => "invalidate_all",
        }
    }
}

impl fmt::Display for CacheUpdateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire record broadcast on the invalidation channel.
///
/// Target fields are plain strings on the wire and are empty for flag-level
/// and invalidate-all messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheUpdateMessage {
    pub action: CacheUpdateAction,
    #[serde(default)]
    pub flag_key: String,
    #[serde(default)]
    pub target_type: String,
    #[serde(default)]
    pub target_id: String,
    /// Unix timestamp in nanoseconds; 0 means "stamp on publish".
    #[serde(default)]
    pub timestamp: i64,
}

impl CacheUpdateMessage {
    fn flag(action: CacheUpdateAction, flag_key: impl Into<String>) -> Self {
        Self {
            action,
            flag_key: flag_key.into(),
            target_type: String::new(),
            target_id: String::new(),
            timestamp: 0,
        }
    }

    fn override_(action: CacheUpdateAction, key: &OverrideKey) -> Self {
        Self {
            action,
            flag_key: key.flag_key.clone(),
            target_type: key.target_type.as_str().to_string(),
            target_id: key.target_id.to_string(),
            timestamp: 0,
        }
    }

    pub fn flag_updated(flag_key: impl Into<String>) -> Self {
        Self::flag(CacheUpdateAction::FlagUpdated, flag_key)
    }

    pub fn flag_deleted(flag_key: impl Into<String>) -> Self {
        Self::flag(CacheUpdateAction::FlagDeleted, flag_key)
    }

    pub fn override_updated(key: &OverrideKey) -> Self {
        Self::override_(CacheUpdateAction::OverrideUpdated, key)
    }

    pub fn override_deleted(key: &OverrideKey) -> Self {
        Self::override_(CacheUpdateAction::OverrideDeleted, key)
    }

    pub fn invalidate_all() -> Self {
        Self::flag(CacheUpdateAction::InvalidateAll, "")
    }

    /// Set the timestamp to now unless the publisher already provided one.
    pub fn stamp(&mut self) {
        if self.timestamp == 0 {
            let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
            self.timestamp = i64::try_from(nanos).unwrap_or(i64::MAX);
        }
    }

    /// Parse the override identity carried by an override message.
    ///
    /// Returns `Ok(None)` when the target fields are empty.
    pub fn override_key(&self) -> Result<Option<OverrideKey>, CacheError> {
        if self.target_type.is_empty() || self.target_id.is_empty() {
            return Ok(None);
        }
        let target_type = self.target_type.parse::<OverrideTargetType>()?;
        let target_id = Uuid::parse_str(&self.target_id).map_err(|e| {
            CacheError::InvalidMessage(format!("invalid target id '{}': {e}", self.target_id))
        })?;
        Ok(Some(OverrideKey::new(
            self.flag_key.clone(),
            target_type,
            target_id,
        )))
    }

    pub fn encode(&self) -> Result<String, CacheError> {
        serde_json::to_string(self).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    pub fn decode(payload: &str) -> Result<Self, CacheError> {
        serde_json::from_str(payload).map_err(|e| CacheError::InvalidMessage(e.to_string()))
    }
}

/// Aggregated statistics of the tiered cache.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l2_hits: u64,
    pub l2_misses: u64,
    pub total_hits: u64,
    /// Only reads that missed both tiers.
    pub total_misses: u64,
    /// `total_hits / (total_hits + total_misses)`, 0.0 before any read.
    pub hit_ratio: f64,
    /// L1 flag + override entries (expired-but-unswept entries included).
    pub cache_entries: usize,
}

impl CacheStats {
    pub fn from_counters(l1_hits: u64, l1_misses: u64, l2_hits: u64, l2_misses: u64) -> Self {
        let total_hits = l1_hits + l2_hits;
        let total_misses = l2_misses;
        let total = total_hits + total_misses;
        let hit_ratio = if total == 0 {
            0.0
        } else {
            total_hits as f64 / total as f64
        };
        Self {
            l1_hits,
            l1_misses,
            l2_hits,
            l2_misses,
            total_hits,
            total_misses,
            hit_ratio,
            cache_entries: 0,
        }
    }
}
