//! Tracing setup for the flag cache node.
//!
//! The filter sits behind a reload layer: tracing starts at a fixed level before
//! the configuration is read, and the configured level is applied afterwards.

use std::sync::OnceLock;
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

static FILTER_HANDLE: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

fn filter_for(level: &str) -> EnvFilter {
    // RUST_LOG wins over the configured level
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

pub fn init_tracing() {
    init_tracing_with_level("info");
}

pub fn init_tracing_with_level(level: &str) {
    let (filter, handle) = reload::Layer::new(filter_for(level));
    if FILTER_HANDLE.set(handle).is_err() {
        return;
    }

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init();
}

/// Switch to the configured level.
///
/// Returns `false` when `RUST_LOG` is set or tracing was not initialised here.
pub fn apply_logging_level(level: &str) -> bool {
    if std::env::var_os("RUST_LOG").is_some() {
        return false;
    }
    let Some(handle) = FILTER_HANDLE.get() else {
        return false;
    };
    handle.modify(|filter| *filter = EnvFilter::new(level)).is_ok()
}
