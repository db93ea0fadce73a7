//! Metrics for the feature flag cache.
//!
//! Uses the `metrics` facade only; the host process decides which recorder
//! (Prometheus, statsd, ...) to install. Without a recorder every call is a no-op.

use metrics::{counter, gauge};

/// Metric names as constants for consistency.
pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "flag_cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "flag_cache_misses_total";
    pub const CACHE_ENTRIES: &str = "flag_cache_entries";
    pub const INVALIDATIONS_RECEIVED_TOTAL: &str = "flag_cache_invalidations_received_total";
    pub const PUBLISH_FAILURES_TOTAL: &str = "flag_cache_publish_failures_total";
}

/// Record a cache hit.
pub fn record_cache_hit(tier: &'static str) {
    counter!(names::CACHE_HITS_TOTAL, "tier" => tier).increment(1);
}

/// Record a cache miss.
pub fn record_cache_miss(tier: &'static str) {
    counter!(names::CACHE_MISSES_TOTAL, "tier" => tier).increment(1);
}

/// Set the number of L1 entries for a value family ("flag" or "override").
pub fn set_cache_entries(family: &'static str, count: usize) {
    gauge!(names::CACHE_ENTRIES, "family" => family).set(count as f64);
}

/// Record an invalidation message received from the channel.
pub fn record_invalidation_received(action: &'static str) {
    counter!(names::INVALIDATIONS_RECEIVED_TOTAL, "action" => action).increment(1);
}

/// Record a failed invalidation broadcast.
pub fn record_publish_failure() {
    counter!(names::PUBLISH_FAILURES_TOTAL).increment(1);
}
