//! One live feed session bound to one book and one storage file.
//!
//! [`FeedConnection`] opens the socket, subscribes, and then runs three
//! tasks until the socket dies or the connection is shut down: a receive
//! loop feeding the [`BookState`], a fixed-interval keepalive, and a
//! throughput monitor. It never reconnects itself; when the socket closes
//! or errors the liveness flag drops and the owner decides what to do.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tungstenite::Message;

use super::{WsReader, WsWriter, connect, feed_url, handle_frame, ping, subscribe};
use crate::{Result, RollbookError};
use crate::book::BookState;
use crate::config::FeedConfig;
use crate::models::SubscribeRequest;
use crate::storage::writer::StorageWriter;

/// Why the receive loop exited.
#[derive(Debug)]
enum DisconnectReason {
    /// The server closed the stream.
    Closed,
    /// Reading from the socket failed.
    ConnectionError,
    /// The connection was asked to stop.
    Shutdown,
}

/// Counters shared between the receive loop and the monitor.
#[derive(Debug)]
pub struct FeedStats {
    started: Instant,
    messages: AtomicU64,
}

impl FeedStats {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            messages: AtomicU64::new(0),
        }
    }

    /// Text frames received since the connection opened.
    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    pub fn runtime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Average messages per second since open.
    pub fn rate(&self) -> f64 {
        let secs = self.runtime().as_secs_f64();
        if secs > 0.0 {
            self.messages() as f64 / secs
        } else {
            0.0
        }
    }
}

/// A subscribed feed socket driving one [`BookState`].
pub struct FeedConnection {
    subscription_key: String,
    book: Arc<BookState>,
    stats: Arc<FeedStats>,
    alive: Arc<AtomicBool>,
    closed: AtomicBool,
    cancel: CancellationToken,
    sink: Arc<tokio::sync::Mutex<Option<WsWriter>>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    writer_timeout: Duration,
    io_timeout: Duration,
}

impl FeedConnection {
    /// Opens a `market` channel connection for `subscription_key`.
    ///
    /// `writer` is owned by the connection from here on: it is shut down
    /// with the connection, or immediately if opening fails.
    ///
    /// # Errors
    ///
    /// Returns a [`RollbookError`](crate::RollbookError) if connecting or
    /// subscribing fails.
    pub async fn open(
        config: &FeedConfig,
        subscription_key: &str,
        writer: Arc<StorageWriter>,
        writer_timeout: Duration,
    ) -> Result<Self> {
        let request = SubscribeRequest::market(&[subscription_key.to_string()]);
        Self::open_with(config, request, subscription_key, writer, writer_timeout).await
    }

    /// Opens a connection on the channel named by `request` and sends it as
    /// the single subscription message.
    ///
    /// # Errors
    ///
    /// Returns [`RollbookError::ConnectTimeout`] if the handshake does not
    /// finish within `config.connect_timeout`, or the connect or subscribe
    /// error.
    pub async fn open_with(
        config: &FeedConfig,
        request: SubscribeRequest,
        subscription_key: &str,
        writer: Arc<StorageWriter>,
        writer_timeout: Duration,
    ) -> Result<Self> {
        let url = feed_url(&config.websocket_url, request.channel());
        info!(url = %url, key = subscription_key, "Opening feed connection");

        let pending = tokio::time::timeout(config.connect_timeout, handshake(&url, &request));
        let outcome = pending.await.unwrap_or_else(|_| {
            Err(RollbookError::ConnectTimeout {
                url: url.clone(),
                timeout: config.connect_timeout,
            })
        });
        let (write, read) = match outcome {
            Ok(pair) => pair,
            Err(e) => {
                close_unopened_writer(writer, writer_timeout).await;
                return Err(e);
            }
        };

        let connection = Self {
            subscription_key: subscription_key.to_string(),
            book: Arc::new(BookState::with_writer(subscription_key, writer)),
            stats: Arc::new(FeedStats::new()),
            alive: Arc::new(AtomicBool::new(true)),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            sink: Arc::new(tokio::sync::Mutex::new(Some(write))),
            tasks: parking_lot::Mutex::new(Vec::with_capacity(3)),
            writer_timeout,
            io_timeout: config.connect_timeout,
        };
        connection.spawn_tasks(read, config);
        Ok(connection)
    }

    fn spawn_tasks(&self, read: WsReader, config: &FeedConfig) {
        let receive = tokio::spawn(receive_loop(
            read,
            self.book.clone(),
            self.stats.clone(),
            self.alive.clone(),
            self.cancel.clone(),
        ));
        let keepalive = tokio::spawn(keepalive_loop(
            self.sink.clone(),
            config.keepalive_interval,
            self.alive.clone(),
            self.cancel.clone(),
        ));
        let monitor = tokio::spawn(monitor_loop(
            self.book.clone(),
            self.stats.clone(),
            config.monitor_interval,
            self.cancel.clone(),
        ));
        self.tasks.lock().extend([receive, keepalive, monitor]);
    }

    pub fn subscription_key(&self) -> &str {
        &self.subscription_key
    }

    pub fn book(&self) -> &Arc<BookState> {
        &self.book
    }

    pub fn stats(&self) -> &Arc<FeedStats> {
        &self.stats
    }

    /// Returns `true` while the socket is up and the bound writer is healthy.
    pub fn is_running(&self) -> bool {
        self.alive.load(Ordering::Acquire)
            && !self.closed.load(Ordering::Acquire)
            && self.book.writer().is_none_or(|w| !w.is_failed())
    }

    /// Closes the socket, stops the background tasks, then shuts the bound
    /// writer down. Only the first call does any work.
    ///
    /// # Errors
    ///
    /// Returns the writer's shutdown error: a failed commit or a drain that
    /// did not finish within the configured timeout.
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(key = %self.subscription_key, "Shutting down feed connection");

        self.alive.store(false, Ordering::Release);
        self.cancel.cancel();
        if let Some(mut sink) = self.sink.lock().await.take() {
            match tokio::time::timeout(self.io_timeout, sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(key = %self.subscription_key, error = %e, "Socket close failed");
                }
                Err(_) => warn!(key = %self.subscription_key, "Socket close timed out"),
            }
        }

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(key = %self.subscription_key, error = %e, "Feed task ended abnormally");
            }
        }

        let book = self.book.clone();
        let timeout = self.writer_timeout;
        tokio::task::spawn_blocking(move || book.rebind_writer(None, timeout)).await??;

        info!(key = %self.subscription_key, "Feed connection closed");
        Ok(())
    }
}

impl Drop for FeedConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn close_unopened_writer(writer: Arc<StorageWriter>, timeout: Duration) {
    let path = writer.path().to_path_buf();
    match tokio::task::spawn_blocking(move || writer.shutdown(timeout)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(
                path = %path.display(),
                error = %e,
                "Failed to close writer of unopened connection"
            );
        }
        Err(e) => error!(path = %path.display(), error = %e, "Writer close task failed"),
    }
}

async fn handshake(url: &str, request: &SubscribeRequest) -> Result<(WsWriter, WsReader)> {
    let (mut write, read) = connect(url).await?;
    subscribe(&mut write, request).await?;
    Ok((write, read))
}

async fn receive_loop(
    mut read: WsReader,
    book: Arc<BookState>,
    stats: Arc<FeedStats>,
    alive: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let key = book.subscription_key().to_string();
    let reason = loop {
        tokio::select! {
            () = cancel.cancelled() => break DisconnectReason::Shutdown,
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    stats.messages.fetch_add(1, Ordering::Relaxed);
                    handle_frame(&book, &text);
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(key = %key, ?frame, "Feed closed by server");
                    break DisconnectReason::Closed;
                }
                Some(Ok(_)) => {} // Binary/Ping/Pong frames
                Some(Err(e)) => {
                    warn!(key = %key, error = %e, "Feed connection error");
                    break DisconnectReason::ConnectionError;
                }
                None => {
                    warn!(key = %key, "Feed stream ended");
                    break DisconnectReason::Closed;
                }
            }
        }
    };

    alive.store(false, Ordering::Release);
    debug!(key = %key, ?reason, "Receive loop exited");
}

async fn keepalive_loop(
    sink: Arc<tokio::sync::Mutex<Option<WsWriter>>>,
    period: Duration,
    alive: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let mut guard = sink.lock().await;
        let Some(write) = guard.as_mut() else {
            return;
        };
        let sent = tokio::select! {
            () = cancel.cancelled() => return,
            sent = tokio::time::timeout(period, ping(write)) => sent,
        };
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "Keepalive failed");
                alive.store(false, Ordering::Release);
                return;
            }
            Err(_) => {
                warn!(?period, "Keepalive send stalled");
                alive.store(false, Ordering::Release);
                return;
            }
        }
    }
}

async fn monitor_loop(
    book: Arc<BookState>,
    stats: Arc<FeedStats>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let writer = book.writer();
        info!(
            key = book.subscription_key(),
            runtime_secs = stats.runtime().as_secs(),
            messages = stats.messages(),
            rate = %format_args!("{:.1}", stats.rate()),
            queue_depth = writer.as_ref().map_or(0, |w| w.queue_depth()),
            dropped = writer.as_ref().map_or(0, |w| w.rows_dropped()),
            file_mb = %format_args!("{:.2}", writer.as_ref().map_or(0.0, |w| w.file_size_mb())),
            "Feed stats"
        );
    }
}
