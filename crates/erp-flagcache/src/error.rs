use thiserror::Error;

/// Errors produced by the feature flag cache tiers and the invalidation channel.
///
/// A plain cache miss is never an error: tiers report it as `Ok(None)`.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Redis pool error: {0}")]
    Pool(String),

    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The shared tier held a payload that could not be decoded. The key has
    /// already been removed when this is returned.
    #[error("Corrupted cache entry {key}: {message}")]
    Deserialization { key: String, message: String },

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Subscribe error: {0}")]
    Subscribe(String),

    #[error("Invalidation subscription already running")]
    AlreadyRunning,

    #[error("Component is closed")]
    Closed,

    #[error("Invalidation channel closed unexpectedly")]
    ChannelClosed,

    #[error("Invalid invalidation message: {0}")]
    InvalidMessage(String),

    #[error("Flag source error: {0}")]
    Source(String),
}

impl CacheError {
    pub fn pool(msg: impl std::fmt::Display) -> Self {
        Self::Pool(msg.to_string())
    }

    pub fn connection(msg: impl std::fmt::Display) -> Self {
        Self::Connection(msg.to_string())
    }

    /// True for errors that mean the shared tier could not be reached at all.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Pool(_) | Self::Connection(_) | Self::Command(_))
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() {
            Self::Connection(e.to_string())
        } else {
            Self::Command(e.to_string())
        }
    }
}

impl From<deadpool_redis::PoolError> for CacheError {
    fn from(e: deadpool_redis::PoolError) -> Self {
        Self::Pool(e.to_string())
    }
}

/// Result type for cache operations
pub type CacheResult<T> = std::result::Result<T, CacheError>;
