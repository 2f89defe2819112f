//! Application configuration loaded from environment variables.
//!
//! Every value has a default, so an empty environment yields a working
//! recorder for the four default assets on the 15-minute window. Variables
//! that are set but empty are treated as absent.
//!
//! - `ROLLBOOK_WEBSOCKET_URL`: feed endpoint base (`/ws/<channel>` is appended)
//! - `ROLLBOOK_GAMMA_URL` / `ROLLBOOK_CLOB_URL`: catalog and key-resolution REST bases
//! - `ROLLBOOK_ASSETS`: comma-separated list of tracked assets
//! - `ROLLBOOK_WINDOW`: instrument window classifier (`5m`, `15m`, `1h`)
//! - `ROLLBOOK_DATA_DIR`: storage root
//! - timing and writer knobs, see [`fetch_config`]

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::models::instrument::WindowKind;
use crate::storage::writer::WriterConfig;

/// Default market-data WebSocket endpoint.
const DEFAULT_WEBSOCKET_URL: &str = "wss://ws-subscriptions-clob.polymarket.com";

/// Default instrument catalog endpoint.
const DEFAULT_GAMMA_URL: &str = "https://gamma-api.polymarket.com";

/// Default subscription-key resolution endpoint.
const DEFAULT_CLOB_URL: &str = "https://clob.polymarket.com";

const DEFAULT_ASSETS: &[&str] = &["Bitcoin", "Ethereum", "Solana", "XRP"];

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub feed: FeedConfig,
    pub catalog: CatalogConfig,
    pub session: SessionConfig,
    pub storage: WriterConfig,
}

/// Market-data feed connection settings.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub websocket_url: String,
    /// Upper bound on connecting and subscribing, and on closing the socket.
    pub connect_timeout: Duration,
    /// Period between two keepalive payloads.
    pub keepalive_interval: Duration,
    /// Period between two throughput log lines.
    pub monitor_interval: Duration,
}

/// Instrument discovery settings.
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub gamma_url: String,
    pub clob_url: String,
    pub window: WindowKind,
    /// Maximum number of events requested per poll.
    pub limit: u32,
}

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub assets: Vec<String>,
    pub data_dir: PathBuf,
    /// How long cached discovery results are reused before polling again.
    pub refresh_interval: Duration,
    pub tick_interval: Duration,
    /// Delay between detecting a dead connection and rebinding it.
    pub reconnect_backoff: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            websocket_url: DEFAULT_WEBSOCKET_URL.to_string(),
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(2),
            monitor_interval: Duration::from_secs(30),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            gamma_url: DEFAULT_GAMMA_URL.to_string(),
            clob_url: DEFAULT_CLOB_URL.to_string(),
            window: WindowKind::FifteenMinutes,
            limit: 20,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            assets: DEFAULT_ASSETS.iter().map(|s| s.to_string()).collect(),
            data_dir: PathBuf::from("data"),
            refresh_interval: Duration::from_secs(299),
            tick_interval: Duration::from_secs(1),
            reconnect_backoff: Duration::from_secs(1),
        }
    }
}

/// Loads the application configuration from environment variables.
///
/// | Variable | Default |
/// |---|---|
/// | `ROLLBOOK_REFRESH_SECS` | 299 |
/// | `ROLLBOOK_TICK_MILLIS` | 1000 |
/// | `ROLLBOOK_RECONNECT_BACKOFF_MILLIS` | 1000 |
/// | `ROLLBOOK_CONNECT_TIMEOUT_SECS` | 10 |
/// | `ROLLBOOK_KEEPALIVE_SECS` | 2 |
/// | `ROLLBOOK_MONITOR_SECS` | 30 |
/// | `ROLLBOOK_FLUSH_INTERVAL_MILLIS` | 5000 |
/// | `ROLLBOOK_BATCH_SIZE` | 10000 |
/// | `ROLLBOOK_QUEUE_CAPACITY` | 500000 |
/// | `ROLLBOOK_SHUTDOWN_TIMEOUT_SECS` | 30 |
/// | `ROLLBOOK_CATALOG_LIMIT` | 20 |
///
/// # Errors
///
/// Returns [`RollbookError::Config`](crate::RollbookError::Config) if a
/// numeric variable does not parse or is zero, if the asset list is empty,
/// or if the window classifier is unknown.
pub fn fetch_config() -> crate::Result<AppConfig> {
    let feed_defaults = FeedConfig::default();
    let catalog_defaults = CatalogConfig::default();
    let session_defaults = SessionConfig::default();
    let storage_defaults = WriterConfig::default();

    let feed = FeedConfig {
        websocket_url: non_empty_var("ROLLBOOK_WEBSOCKET_URL")
            .unwrap_or(feed_defaults.websocket_url),
        connect_timeout: secs_var("ROLLBOOK_CONNECT_TIMEOUT_SECS", feed_defaults.connect_timeout)?,
        keepalive_interval: secs_var("ROLLBOOK_KEEPALIVE_SECS", feed_defaults.keepalive_interval)?,
        monitor_interval: secs_var("ROLLBOOK_MONITOR_SECS", feed_defaults.monitor_interval)?,
    };

    let window = match non_empty_var("ROLLBOOK_WINDOW") {
        Some(raw) => raw.parse()?,
        None => catalog_defaults.window,
    };
    let catalog = CatalogConfig {
        gamma_url: non_empty_var("ROLLBOOK_GAMMA_URL").unwrap_or(catalog_defaults.gamma_url),
        clob_url: non_empty_var("ROLLBOOK_CLOB_URL").unwrap_or(catalog_defaults.clob_url),
        window,
        limit: non_zero_var("ROLLBOOK_CATALOG_LIMIT", catalog_defaults.limit)?,
    };

    let assets = match non_empty_var("ROLLBOOK_ASSETS") {
        Some(raw) => parse_assets(&raw)?,
        None => session_defaults.assets,
    };
    let session = SessionConfig {
        assets,
        data_dir: non_empty_var("ROLLBOOK_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(session_defaults.data_dir),
        refresh_interval: secs_var("ROLLBOOK_REFRESH_SECS", session_defaults.refresh_interval)?,
        tick_interval: millis_var("ROLLBOOK_TICK_MILLIS", session_defaults.tick_interval)?,
        reconnect_backoff: millis_var(
            "ROLLBOOK_RECONNECT_BACKOFF_MILLIS",
            session_defaults.reconnect_backoff,
        )?,
    };

    let storage = WriterConfig {
        flush_interval: millis_var(
            "ROLLBOOK_FLUSH_INTERVAL_MILLIS",
            storage_defaults.flush_interval,
        )?,
        batch_size: non_zero_var("ROLLBOOK_BATCH_SIZE", storage_defaults.batch_size)?,
        queue_capacity: non_zero_var("ROLLBOOK_QUEUE_CAPACITY", storage_defaults.queue_capacity)?,
        shutdown_timeout: secs_var(
            "ROLLBOOK_SHUTDOWN_TIMEOUT_SECS",
            storage_defaults.shutdown_timeout,
        )?,
        ..storage_defaults
    };

    Ok(AppConfig {
        feed,
        catalog,
        session,
        storage,
    })
}

/// Splits a comma-separated asset list, trimming blanks.
fn parse_assets(raw: &str) -> crate::Result<Vec<String>> {
    let assets: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();

    if assets.is_empty() {
        return Err(crate::RollbookError::Config(
            "ROLLBOOK_ASSETS contains no asset names".to_string(),
        ));
    }
    Ok(assets)
}

/// Returns the value of an environment variable if it exists and is non-empty.
fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

/// Parses a strictly positive integer variable, falling back to `default`.
fn non_zero_var<T>(name: &str, default: T) -> crate::Result<T>
where
    T: FromStr + PartialEq + Default,
    T::Err: std::fmt::Display,
{
    let Some(raw) = non_empty_var(name) else {
        return Ok(default);
    };
    let value: T = raw
        .trim()
        .parse()
        .map_err(|e| crate::RollbookError::Config(format!("{name}={raw:?} is invalid: {e}")))?;
    if value == T::default() {
        return Err(crate::RollbookError::Config(format!(
            "{name} must be greater than zero"
        )));
    }
    Ok(value)
}

fn secs_var(name: &str, default: Duration) -> crate::Result<Duration> {
    non_zero_var(name, default.as_secs()).map(Duration::from_secs)
}

fn millis_var(name: &str, default: Duration) -> crate::Result<Duration> {
    non_zero_var(name, default.as_millis() as u64).map(Duration::from_millis)
}
