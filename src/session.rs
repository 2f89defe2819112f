//! Per-asset session orchestration.
//!
//! The [`Orchestrator`] owns one [`AssetSession`] record per tracked asset
//! and ticks them on a fixed interval. Each tick refreshes the cached
//! windows when the refresh interval has elapsed, picks the window that
//! contains the current time, and moves the asset between three states:
//!
//! - [`SessionState::NoSession`]: nothing valid right now, nothing bound.
//! - [`SessionState::Bound`]: a connection and its file record the current window.
//! - [`SessionState::Dead`]: the window is still valid but the connection died.
//!
//! A binding is always torn down completely before its replacement opens,
//! so an asset never has two live bindings. A reconnect always records
//! into a new file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{FeedConfig, SessionConfig};
use crate::discovery::{MarketCatalog, resolve_primary_key};
use crate::models::instrument::InstrumentWindow;
use crate::storage::session_file_path;
use crate::storage::writer::{StorageWriter, WriterConfig};
use crate::websocket::FeedConnection;
use crate::{Result, RollbookError};

/// Observable state of one asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NoSession,
    Bound,
    Dead,
}

/// What one tick does to one asset.
#[derive(Debug, Clone)]
pub enum Transition {
    /// Nothing to do.
    Stay,
    /// Bind a connection to a newly valid window.
    Open(InstrumentWindow),
    /// The bound window ended; tear down without replacement.
    Close,
    /// A different window is now valid; tear down, then bind the new one.
    Switch(InstrumentWindow),
    /// The connection died inside its window; tear down, then bind again into a new file.
    Reconnect,
    /// The connection died but the reconnect delay has not passed yet.
    AwaitBackoff,
}

/// Chooses the transition for one asset.
///
/// `bound` is the window of the current binding and `running` its liveness.
/// `backoff_elapsed` tells whether the connection has been dead for at
/// least the reconnect delay. `candidate` is the cached window containing
/// the current time. Windows are compared by timing only.
pub fn decide(
    bound: Option<&InstrumentWindow>,
    running: bool,
    backoff_elapsed: bool,
    candidate: Option<&InstrumentWindow>,
) -> Transition {
    match (bound, candidate) {
        (None, None) => Transition::Stay,
        (None, Some(next)) => Transition::Open(next.clone()),
        (Some(_), None) => Transition::Close,
        (Some(current), Some(next)) if !current.same_timing(next) => {
            Transition::Switch(next.clone())
        }
        (Some(_), Some(_)) if running => Transition::Stay,
        (Some(_), Some(_)) if backoff_elapsed => Transition::Reconnect,
        (Some(_), Some(_)) => Transition::AwaitBackoff,
    }
}

/// Settings and collaborators shared by every asset session.
pub struct SessionContext {
    pub catalog: Arc<dyn MarketCatalog>,
    pub feed: FeedConfig,
    pub session: SessionConfig,
    pub storage: WriterConfig,
}

/// A live connection recording one window into one file.
struct Binding {
    window: InstrumentWindow,
    subscription_key: String,
    path: PathBuf,
    connection: FeedConnection,
}

/// Everything the orchestrator tracks for one asset.
pub struct AssetSession {
    asset: String,
    windows: Vec<InstrumentWindow>,
    last_refresh: Option<DateTime<Utc>>,
    binding: Option<Binding>,
    dead_since: Option<DateTime<Utc>>,
    retry_not_before: Option<DateTime<Utc>>,
    files: Vec<PathBuf>,
}

impl AssetSession {
    #[must_use]
    pub fn new(asset: impl Into<String>) -> Self {
        Self {
            asset: asset.into(),
            windows: Vec::new(),
            last_refresh: None,
            binding: None,
            dead_since: None,
            retry_not_before: None,
            files: Vec::new(),
        }
    }

    pub fn asset(&self) -> &str {
        &self.asset
    }

    pub fn state(&self) -> SessionState {
        match &self.binding {
            None => SessionState::NoSession,
            Some(b) if b.connection.is_running() => SessionState::Bound,
            Some(_) => SessionState::Dead,
        }
    }

    /// Window of the current binding.
    pub fn bound_window(&self) -> Option<&InstrumentWindow> {
        self.binding.as_ref().map(|b| &b.window)
    }

    pub fn subscription_key(&self) -> Option<&str> {
        self.binding.as_ref().map(|b| b.subscription_key.as_str())
    }

    /// File of the current binding.
    pub fn file_path(&self) -> Option<&Path> {
        self.binding.as_ref().map(|b| b.path.as_path())
    }

    /// Every file this asset has recorded into, oldest first.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Runs one tick for this asset at `now`.
    pub async fn tick(&mut self, ctx: &SessionContext, now: DateTime<Utc>) {
        self.refresh_if_due(ctx, now).await;

        let candidate = self.windows.iter().find(|w| w.contains(now)).cloned();
        let running = self.binding.as_ref().is_some_and(|b| b.connection.is_running());
        if self.binding.is_some() && !running && self.dead_since.is_none() {
            warn!(asset = %self.asset, "Connection is dead");
            self.dead_since = Some(now);
        }
        let backoff_elapsed = self
            .dead_since
            .is_some_and(|since| now - since >= to_delta(ctx.session.reconnect_backoff));

        match decide(self.bound_window(), running, backoff_elapsed, candidate.as_ref()) {
            Transition::Stay | Transition::AwaitBackoff => {}
            Transition::Open(window) => {
                if self.retry_not_before.is_some_and(|t| now < t) {
                    return;
                }
                self.open(ctx, window, now).await;
            }
            Transition::Close => {
                if let Some(window) = self.bound_window() {
                    info!(
                        asset = %self.asset,
                        window = %window.name,
                        "Window ended, closing session"
                    );
                }
                if let Err(e) = self.teardown().await {
                    debug!(asset = %self.asset, error = %e, "Closed session left an invalid file");
                }
            }
            Transition::Switch(window) => {
                info!(asset = %self.asset, window = %window.name, "Switching to new window");
                if let Err(e) = self.teardown().await {
                    debug!(asset = %self.asset, error = %e, "Old session left an invalid file");
                }
                self.open(ctx, window, now).await;
            }
            Transition::Reconnect => {
                let Some(window) = self.bound_window().cloned() else {
                    return;
                };
                info!(
                    asset = %self.asset,
                    window = %window.name,
                    "Reconnecting into a new file"
                );
                if let Err(e) = self.teardown().await {
                    debug!(asset = %self.asset, error = %e, "Dead session left an invalid file");
                }
                self.open(ctx, window, now).await;
            }
        }
    }

    async fn refresh_if_due(&mut self, ctx: &SessionContext, now: DateTime<Utc>) {
        let due = self
            .last_refresh
            .is_none_or(|last| now - last >= to_delta(ctx.session.refresh_interval));
        if !due {
            return;
        }

        info!(asset = %self.asset, "Refreshing instrument windows");
        self.last_refresh = Some(now);
        self.retry_not_before = None;
        match ctx.catalog.list_windows(&self.asset, now).await {
            Ok(windows) => self.windows = windows,
            Err(e) => {
                warn!(asset = %self.asset, error = %e, "Discovery failed, keeping cached windows");
            }
        }
    }

    async fn open(&mut self, ctx: &SessionContext, window: InstrumentWindow, now: DateTime<Utc>) {
        match self.bind(ctx, &window, now).await {
            Ok(binding) => {
                info!(
                    asset = %self.asset,
                    window = %window.name,
                    key = %binding.subscription_key,
                    path = %binding.path.display(),
                    "Session bound"
                );
                self.files.push(binding.path.clone());
                self.binding = Some(binding);
                self.dead_since = None;
                self.retry_not_before = None;
            }
            Err(e) if is_resolution_error(&e) => {
                warn!(
                    asset = %self.asset,
                    window = %window.name,
                    error = %e,
                    "Resolution failed, waiting for next refresh"
                );
                self.retry_not_before = self
                    .last_refresh
                    .map(|last| last + to_delta(ctx.session.refresh_interval));
            }
            Err(e) => {
                warn!(
                    asset = %self.asset,
                    window = %window.name,
                    error = %e,
                    "Failed to open session"
                );
                self.retry_not_before = Some(now + to_delta(ctx.session.reconnect_backoff));
            }
        }
    }

    async fn bind(
        &self,
        ctx: &SessionContext,
        window: &InstrumentWindow,
        now: DateTime<Utc>,
    ) -> Result<Binding> {
        let condition_id = window.condition_ids.first().ok_or_else(|| {
            RollbookError::Discovery(format!("window {} has no condition", window.name))
        })?;
        let key = resolve_primary_key(ctx.catalog.as_ref(), condition_id).await?;
        let path = session_file_path(&ctx.session.data_dir, &self.asset, &key, now)?;
        let writer = Arc::new(StorageWriter::create(&path, ctx.storage.clone())?);
        let connection =
            FeedConnection::open(&ctx.feed, &key, writer, ctx.storage.shutdown_timeout).await?;

        Ok(Binding {
            window: window.clone(),
            subscription_key: key,
            path,
            connection,
        })
    }

    /// Tears the binding down, logging any storage failure.
    ///
    /// # Errors
    ///
    /// Returns the connection's shutdown error.
    pub async fn teardown(&mut self) -> Result<()> {
        self.dead_since = None;
        let Some(binding) = self.binding.take() else {
            return Ok(());
        };
        match binding.connection.shutdown().await {
            Ok(()) => {
                info!(asset = %self.asset, path = %binding.path.display(), "Session closed");
                Ok(())
            }
            Err(e) => {
                error!(
                    asset = %self.asset,
                    path = %binding.path.display(),
                    error = %e,
                    "Session teardown failed, file may be invalid"
                );
                Err(e)
            }
        }
    }
}

/// The control loop over every tracked asset.
pub struct Orchestrator {
    ctx: SessionContext,
    sessions: Vec<AssetSession>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(ctx: SessionContext) -> Self {
        let sessions = ctx.session.assets.iter().map(AssetSession::new).collect();
        Self { ctx, sessions }
    }

    pub fn sessions(&self) -> &[AssetSession] {
        &self.sessions
    }

    pub fn session(&self, asset: &str) -> Option<&AssetSession> {
        self.sessions.iter().find(|s| s.asset == asset)
    }

    /// Ticks every asset once at `now`, all assets concurrently.
    pub async fn tick(&mut self, now: DateTime<Utc>) {
        let ctx = &self.ctx;
        join_all(self.sessions.iter_mut().map(|session| session.tick(ctx, now))).await;
    }

    /// Ticks until `cancel` fires, then shuts every session down.
    ///
    /// # Errors
    ///
    /// Returns the last teardown error, after every session had its chance
    /// to shut down.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        info!(assets = ?self.ctx.session.assets, "Orchestrator started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = self.tick(Utc::now()) => {}
            }
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.ctx.session.tick_interval) => {}
            }
        }
        self.shutdown().await
    }

    /// Tears down every bound session concurrently. A failing session does
    /// not stop the others from shutting down.
    ///
    /// # Errors
    ///
    /// Returns the last teardown error.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down all sessions");
        let outcomes = join_all(self.sessions.iter_mut().map(|session| session.teardown())).await;
        info!("All sessions shut down");
        outcomes.into_iter().filter_map(|outcome| outcome.err()).last().map_or(Ok(()), Err)
    }
}

/// Errors that a retry cannot fix before the catalog is polled again.
fn is_resolution_error(e: &RollbookError) -> bool {
    matches!(
        e,
        RollbookError::SubscriptionKeys { .. }
            | RollbookError::Discovery(_)
            | RollbookError::Http(_)
    )
}

fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}
