//! Shared test utilities: a loopback feed server and parquet readers.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use arrow::array::{Array, StringArray};
use futures_util::{SinkExt, StreamExt};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tungstenite::Message;

use rollbook::config::FeedConfig;
use rollbook::storage::writer::WriterConfig;

/// Live Polymarket market-data endpoint.
pub const POLYMARKET_WS_URL: &str = "wss://ws-subscriptions-clob.polymarket.com";

pub const BOOK_JSON: &str = include_str!("../fixtures/book.json");
pub const PRICE_CHANGE_JSON: &str = include_str!("../fixtures/price_change.json");

/// Selects the ring provider for rustls, as the binary does at startup.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Commands for one accepted server-side connection.
pub enum ServerCommand {
    Send(String),
    /// Drops the socket without a close handshake.
    Kill,
}

/// Handle to one accepted connection.
pub struct ServerConnection {
    commands: mpsc::UnboundedSender<ServerCommand>,
}

impl ServerConnection {
    pub fn send(&self, frame: &str) {
        let _ = self.commands.send(ServerCommand::Send(frame.to_string()));
    }

    pub fn kill(&self) {
        let _ = self.commands.send(ServerCommand::Kill);
    }
}

/// A local WebSocket server that plays the feed side of the protocol.
///
/// Every accepted connection reports itself, then its first text message
/// (the subscription). Keepalive payloads are answered with `PONG` and
/// counted.
pub struct FeedServer {
    pub endpoint: String,
    pub pings: Arc<AtomicUsize>,
    connections: mpsc::UnboundedReceiver<ServerConnection>,
    subscriptions: mpsc::UnboundedReceiver<serde_json::Value>,
}

impl FeedServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}", listener.local_addr().unwrap());
        let pings = Arc::new(AtomicUsize::new(0));
        let (conn_tx, connections) = mpsc::unbounded_channel();
        let (sub_tx, subscriptions) = mpsc::unbounded_channel();

        let server_pings = pings.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
                let _ = conn_tx.send(ServerConnection { commands: cmd_tx });
                tokio::spawn(serve(ws, cmd_rx, sub_tx.clone(), server_pings.clone()));
            }
        });

        Self {
            endpoint,
            pings,
            connections,
            subscriptions,
        }
    }

    pub async fn next_connection(&mut self) -> ServerConnection {
        tokio::time::timeout(Duration::from_secs(5), self.connections.recv())
            .await
            .expect("no connection within 5s")
            .expect("server stopped")
    }

    pub async fn next_subscription(&mut self) -> serde_json::Value {
        tokio::time::timeout(Duration::from_secs(5), self.subscriptions.recv())
            .await
            .expect("no subscription within 5s")
            .expect("server stopped")
    }

    pub fn feed_config(&self) -> FeedConfig {
        FeedConfig {
            websocket_url: self.endpoint.clone(),
            connect_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_millis(100),
            monitor_interval: Duration::from_secs(60),
        }
    }
}

async fn serve(
    ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    mut commands: mpsc::UnboundedReceiver<ServerCommand>,
    subscriptions: mpsc::UnboundedSender<serde_json::Value>,
    pings: Arc<AtomicUsize>,
) {
    let (mut write, mut read) = ws.split();
    let mut subscribed = false;
    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(ServerCommand::Send(frame)) => {
                    if write.send(Message::Text(frame.into())).await.is_err() {
                        return;
                    }
                }
                Some(ServerCommand::Kill) | None => return,
            },
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) if text.as_str() == "PING" => {
                    pings.fetch_add(1, Ordering::SeqCst);
                    let _ = write.send(Message::Text("PONG".into())).await;
                }
                Some(Ok(Message::Text(text))) if !subscribed => {
                    subscribed = true;
                    if let Ok(value) = serde_json::from_str(text.as_str()) {
                        let _ = subscriptions.send(value);
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => return,
            },
        }
    }
}

/// Binds a listener that accepts TCP connections but never answers the
/// WebSocket upgrade. Accepted sockets are held open for the test's lifetime.
pub async fn silent_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    endpoint
}

/// A sink that takes the 4-byte parquet magic, then fails every write.
#[derive(Default)]
pub struct BrokenDisk {
    accepted: usize,
}

impl std::io::Write for BrokenDisk {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.accepted < 4 {
            let n = buf.len().min(4 - self.accepted);
            self.accepted += n;
            return Ok(n);
        }
        Err(std::io::Error::other("device unplugged"))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// The book fixture with a market id too large to stay in a write buffer.
pub fn wide_book_frame() -> String {
    let mut state = 0x2545_f491_4f6c_dd1d_u64;
    let market: String = (0..32_768)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            char::from(b'a' + (state % 26) as u8)
        })
        .collect();
    let mut frame: serde_json::Value = serde_json::from_str(BOOK_JSON).unwrap();
    frame[0]["market"] = serde_json::Value::String(market);
    frame.to_string()
}

/// Writer settings that commit quickly.
pub fn fast_writer_config() -> WriterConfig {
    WriterConfig {
        flush_interval: Duration::from_millis(50),
        poll_interval: Duration::from_millis(10),
        ..WriterConfig::default()
    }
}

/// Polls `check` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Reads the `(side, price, size)` columns of a closed parquet file.
pub fn read_levels(path: &Path) -> Vec<(String, f64, f64)> {
    let file = std::fs::File::open(path).unwrap();
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .unwrap()
        .build()
        .unwrap();

    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch.unwrap();
        let side = batch
            .column_by_name("side")
            .unwrap()
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap()
            .clone();
        let price = batch
            .column_by_name("price")
            .unwrap()
            .as_any()
            .downcast_ref::<arrow::array::Float64Array>()
            .unwrap()
            .clone();
        let size = batch
            .column_by_name("size")
            .unwrap()
            .as_any()
            .downcast_ref::<arrow::array::Float64Array>()
            .unwrap()
            .clone();
        for i in 0..side.len() {
            rows.push((side.value(i).to_string(), price.value(i), size.value(i)));
        }
    }
    rows
}
