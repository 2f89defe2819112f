//! Crate-level error types.
//!
//! [`RollbookError`] unifies every error source (configuration, WebSocket,
//! HTTP, JSON, parquet) behind a single enum so callers can match on the
//! variant they care about while still using the `?` operator for easy
//! propagation.
//!
//! Storage failures ([`RollbookError::WriterFailed`] and
//! [`RollbookError::WriterShutdownTimeout`]) are fatal for the file they
//! refer to: the file must be treated as invalid and is never written again.

use std::path::PathBuf;
use std::time::Duration;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RollbookError>;

/// Top-level error type returned by all public APIs.
#[derive(Debug, thiserror::Error)]
pub enum RollbookError {
    /// A configuration value was missing, empty, or could not be parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// A WebSocket operation (connect, send, receive) failed.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// An HTTP request to the instrument catalog failed.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A filesystem operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The parquet encoder rejected a write or close.
    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// A record batch could not be assembled.
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// A payload did not have the expected shape.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The instrument catalog returned something unusable.
    #[error("discovery error: {0}")]
    Discovery(String),

    /// A settlement condition did not resolve to exactly two subscription keys.
    #[error("condition {condition_id} resolved to {count} subscription keys, expected 2")]
    SubscriptionKeys { condition_id: String, count: usize },

    /// The feed handshake (connect and subscribe) did not finish in time.
    #[error("handshake with {url} did not complete within {timeout:?}")]
    ConnectTimeout { url: String, timeout: Duration },

    /// A background task panicked or was cancelled before completing.
    #[error("task error: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// The destination file already exists and may be bound to another writer.
    #[error("file {} is already bound to a writer", .0.display())]
    FileAlreadyBound(PathBuf),

    /// The background commit loop did not stop in time; buffered rows may be lost.
    #[error(
        "writer for {} did not shut down within {timeout:?}, data loss possible",
        path.display()
    )]
    WriterShutdownTimeout { path: PathBuf, timeout: Duration },

    /// A commit failed; the file may be corrupt and receives no further writes.
    #[error("writer for {} failed: {reason}", path.display())]
    WriterFailed { path: PathBuf, reason: String },
}
