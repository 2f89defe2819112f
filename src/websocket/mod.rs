//! Async WebSocket client for the market-data feed.
//!
//! This module is organized by concern:
//! - [`subscription`] - the single subscribe message sent on open
//! - [`handler`] - decoding inbound frames into a [`BookState`](crate::book::BookState)
//! - [`connection`] - the [`FeedConnection`] session with its background tasks

mod connection;
mod handler;
mod subscription;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use tungstenite::Message;

use crate::Result;
use crate::models::{Channel, KEEPALIVE_PAYLOAD};

pub use connection::{FeedConnection, FeedStats};
pub use handler::{FrameOutcome, handle_frame};
pub use subscription::subscribe;

/// Write half of a feed connection.
pub type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Read half of a feed connection.
pub type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Builds the channel URL, `<endpoint>/ws/<channel>`.
pub fn feed_url(endpoint: &str, channel: Channel) -> String {
    format!("{}/ws/{}", endpoint.trim_end_matches('/'), channel.as_str())
}

/// Establishes a WebSocket connection to the given URL.
///
/// # Errors
///
/// Returns a [`RollbookError`](crate::RollbookError) if the connection or TLS handshake fails.
pub async fn connect(url: &str) -> Result<(WsWriter, WsReader)> {
    let (ws_stream, _) = connect_async(url).await?;
    info!(url, "WebSocket handshake completed");

    Ok(ws_stream.split())
}

/// Sends the literal keepalive payload.
///
/// # Errors
///
/// Returns a [`RollbookError`](crate::RollbookError) if sending the message fails.
pub async fn ping(write: &mut WsWriter) -> Result<()> {
    write.send(Message::Text(KEEPALIVE_PAYLOAD.into())).await?;
    debug!("Sent keepalive");

    Ok(())
}
