//! Feature flag cache node: keeps a local L1 in sync with the fleet and
//! periodically reports cache statistics.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use erp_flagcache::cache::SubscriptionState;
use erp_flagcache::config::loader::load_config;
use erp_flagcache::{CacheError, CacheResult, FlagCache, TieredFlagCache, connect_tiered_cache};
use tokio_util::sync::CancellationToken;

/// How the configuration path was determined.
#[derive(Debug, Clone, Copy)]
enum ConfigSource {
    /// From --config CLI argument
    CliArgument,
    /// From FLAGCACHE_CONFIG environment variable
    EnvironmentVariable,
    /// Default path (flagcache.toml)
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CliArgument => write!(f, "CLI argument (--config)"),
            Self::EnvironmentVariable => write!(f, "environment variable (FLAGCACHE_CONFIG)"),
            Self::Default => write!(f, "default"),
        }
    }
}

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);
const RUNNING_POLL: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        // Not an error if .env doesn't exist
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
        {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    erp_flagcache::observability::init_tracing();

    let (config_path, source) = resolve_config_path();

    let cfg = match load_config(Some(&config_path)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };

    tracing::info!(path = %config_path, source = %source, "Configuration loaded");
    erp_flagcache::observability::apply_logging_level(&cfg.logging.level);

    if let Err(e) = run(cfg).await {
        tracing::error!(error = %e, "flag cache node failed");
        std::process::exit(1);
    }
}

async fn run(cfg: erp_flagcache::AppConfig) -> anyhow::Result<()> {
    let cache = connect_tiered_cache(&cfg).await?;

    let shutdown = CancellationToken::new();
    let listener = tokio::spawn(listen_with_backoff(Arc::clone(&cache), shutdown.clone()));

    let mut stats_ticker =
        tokio::time::interval(Duration::from_secs(cfg.logging.stats_interval_secs));
    stats_ticker.tick().await;

    loop {
        tokio::select! {
            _ = stats_ticker.tick() => log_stats(&cache).await,
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::warn!(error = %e, "failed to listen for shutdown signal");
                }
                break;
            }
        }
    }

    tracing::info!("shutting down flag cache node");
    shutdown.cancel();
    cache.close().await?;
    if let Err(e) = listener.await {
        tracing::warn!(error = %e, "invalidation listener task failed");
    }
    Ok(())
}

/// Keep the invalidation subscription alive, reconnecting with exponential backoff.
///
/// Stops once the cache is closed or `shutdown` is cancelled; a pending backoff
/// sleep is cut short by either.
async fn listen_with_backoff(cache: Arc<TieredFlagCache>, shutdown: CancellationToken) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let (result, reached_running) = tokio::select! {
            _ = shutdown.cancelled() => return,
            outcome = subscribe_once(&cache) => outcome,
        };

        match result {
            Ok(()) | Err(CacheError::Closed) => return,
            Err(CacheError::AlreadyRunning) => {
                tracing::warn!("invalidation subscription already running");
                return;
            }
            Err(e) => {
                let delay = retry_delay(backoff, reached_running);
                tracing::error!(
                    error = %e,
                    backoff_secs = delay.as_secs(),
                    "invalidation subscription lost, reconnecting..."
                );
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                backoff = (delay * 2).min(MAX_BACKOFF);
            }
        }
    }
}

/// Run one subscription attempt, noting whether it ever reached `Running`.
async fn subscribe_once(cache: &TieredFlagCache) -> (CacheResult<()>, bool) {
    let subscription = cache.start_invalidation_subscription();
    tokio::pin!(subscription);

    let mut poll = tokio::time::interval(RUNNING_POLL);
    let mut reached_running = false;

    loop {
        tokio::select! {
            result = &mut subscription => return (result, reached_running),
            _ = poll.tick(), if !reached_running => {
                reached_running = cache
                    .invalidator()
                    .is_some_and(|ch| ch.state() == SubscriptionState::Running);
            }
        }
    }
}

/// Delay before the next attempt. A subscription that got as far as
/// `Running` starts over from the initial delay.
fn retry_delay(pending: Duration, reached_running: bool) -> Duration {
    if reached_running { INITIAL_BACKOFF } else { pending }
}

async fn log_stats(cache: &TieredFlagCache) {
    let stats = cache.get_cache_stats();
    let local = cache.l1().stats();
    let shared_tier_up = cache.is_shared_tier_available().await;
    tracing::info!(
        l1_hits = stats.l1_hits,
        l1_misses = stats.l1_misses,
        l2_hits = stats.l2_hits,
        l2_misses = stats.l2_misses,
        hit_ratio = stats.hit_ratio,
        flags = local.flags,
        overrides = local.overrides,
        expired_evictions = local.expired_evictions,
        shared_tier_up,
        "feature flag cache stats"
    );
}

/// Resolve the configuration file path.
///
/// Priority order:
/// 1. CLI argument: --config <path>
/// 2. Environment variable: FLAGCACHE_CONFIG
/// 3. Default: flagcache.toml
fn resolve_config_path() -> (String, ConfigSource) {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return (path, ConfigSource::CliArgument);
            }
        }
    }

    if let Ok(path) = env::var("FLAGCACHE_CONFIG") {
        if !path.is_empty() {
            return (path, ConfigSource::EnvironmentVariable);
        }
    }

    ("flagcache.toml".to_string(), ConfigSource::Default)
}
