//! Real API integration tests for the Polymarket catalog and market feed.
//!
//! These tests reach the live endpoints and require network access.
//! Run with: `cargo test --features integration-tests`

#![cfg(feature = "integration-tests")]

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use rollbook::config::{CatalogConfig, FeedConfig};
use rollbook::discovery::{GammaCatalog, MarketCatalog, resolve_primary_key};
use rollbook::models::Channel;
use rollbook::storage::writer::StorageWriter;
use rollbook::websocket::{FeedConnection, connect, feed_url, ping};

use common::{POLYMARKET_WS_URL, fast_writer_config, install_crypto_provider, wait_until};

fn tracked() -> Vec<String> {
    vec!["Bitcoin".into(), "Ethereum".into(), "Solana".into(), "XRP".into()]
}

#[tokio::test]
async fn test_connect_to_market_channel() {
    install_crypto_provider();
    let url = feed_url(POLYMARKET_WS_URL, Channel::Market);
    let (mut write, _read) = connect(&url).await.expect("Failed to connect");
    ping(&mut write).await.expect("Failed to send keepalive");
}

#[tokio::test]
async fn test_catalog_lists_bitcoin_windows() {
    install_crypto_provider();
    let catalog = GammaCatalog::new(CatalogConfig::default(), tracked()).unwrap();
    let windows = catalog
        .list_windows("Bitcoin", Utc::now())
        .await
        .expect("Failed to list windows");

    for window in &windows {
        assert_eq!(window.asset, "Bitcoin");
        assert!(window.start < window.end);
    }
}

#[tokio::test]
async fn test_live_window_records_book() {
    install_crypto_provider();
    let catalog = GammaCatalog::new(CatalogConfig::default(), tracked()).unwrap();
    let now = Utc::now();
    let windows = catalog.list_windows("Bitcoin", now).await.unwrap();
    let Some(window) = windows.iter().find(|w| w.contains(now)) else {
        eprintln!("No live Bitcoin window right now, skipping");
        return;
    };

    let key = resolve_primary_key(&catalog, &window.condition_ids[0])
        .await
        .expect("Failed to resolve subscription keys");

    let dir = tempfile::tempdir().unwrap();
    let writer = Arc::new(
        StorageWriter::create(dir.path().join("live.parquet"), fast_writer_config()).unwrap(),
    );
    let connection = FeedConnection::open(
        &FeedConfig::default(),
        &key,
        writer.clone(),
        Duration::from_secs(10),
    )
    .await
    .expect("Failed to open feed connection");

    let book = connection.book().clone();
    let got_book = wait_until(Duration::from_secs(15), || book.last_update().is_some()).await;
    connection.shutdown().await.unwrap();

    assert!(got_book, "No book snapshot received within 15s");
    assert!(writer.rows_written() > 0);
}
