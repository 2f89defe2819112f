//! Live order-book reconstruction for one subscription key.
//!
//! [`BookState`] applies full snapshots and incremental price changes from
//! the feed. Each side is a map keyed by price, so a price appears at most
//! once per side and every stored size is strictly positive. A single mutex
//! guards both sides and the attached writer: a message is applied, stamped
//! and flattened into rows in one critical section, so readers never see a
//! half-applied message and rows are never attributed to the wrong file.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use tracing::debug;

use crate::Result;
use crate::models::book::{PriceChange, PriceLevel};
use crate::storage::writer::StorageWriter;
use crate::storage::{BookRow, RowSide};

/// Book side named by a price change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaSide {
    Buy,
    Sell,
}

impl DeltaSide {
    /// Parses the wire side (`BUY` / `SELL`, any case). Unknown sides yield `None`.
    pub fn from_wire(side: &str) -> Option<Self> {
        if side.eq_ignore_ascii_case("buy") {
            Some(DeltaSide::Buy)
        } else if side.eq_ignore_ascii_case("sell") {
            Some(DeltaSide::Sell)
        } else {
            None
        }
    }
}

/// A consistent copy of the book, levels sorted best first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookSnapshot {
    pub market: String,
    pub last_update: Option<DateTime<Utc>>,
    /// Descending by price.
    pub bids: Vec<(Decimal, Decimal)>,
    /// Ascending by price.
    pub asks: Vec<(Decimal, Decimal)>,
}

#[derive(Default)]
struct BookInner {
    market: String,
    last_update: Option<DateTime<Utc>>,
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    writer: Option<Arc<StorageWriter>>,
}

impl BookInner {
    fn best_bid(&self) -> Option<Decimal> {
        self.bids.keys().next_back().copied()
    }

    fn best_ask(&self) -> Option<Decimal> {
        self.asks.keys().next().copied()
    }

    /// Flattens the current state into rows and hands them to the writer.
    fn emit_rows(&self, asset_id: &str) {
        let Some(writer) = &self.writer else {
            return;
        };
        let timestamp = self
            .last_update
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Micros, true))
            .unwrap_or_default();

        let bids = self.bids.iter().rev().map(|(p, s)| (RowSide::Bid, p, s));
        let asks = self.asks.iter().map(|(p, s)| (RowSide::Ask, p, s));
        writer.enqueue_all(bids.chain(asks).map(|(side, price, size)| BookRow {
            timestamp: timestamp.clone(),
            side,
            price: price.to_f64().unwrap_or_default(),
            size: size.to_f64().unwrap_or_default(),
            asset_id: asset_id.to_string(),
            market: self.market.clone(),
        }));
    }
}

/// Thread-safe bid/ask reconstruction for one subscription key.
pub struct BookState {
    subscription_key: String,
    inner: Mutex<BookInner>,
}

impl BookState {
    /// Creates an empty book with no writer attached.
    #[must_use]
    pub fn new(subscription_key: impl Into<String>) -> Self {
        Self {
            subscription_key: subscription_key.into(),
            inner: Mutex::new(BookInner::default()),
        }
    }

    /// Creates an empty book that persists every mutation to `writer`.
    #[must_use]
    pub fn with_writer(subscription_key: impl Into<String>, writer: Arc<StorageWriter>) -> Self {
        let book = Self::new(subscription_key);
        book.inner.lock().writer = Some(writer);
        book
    }

    pub fn subscription_key(&self) -> &str {
        &self.subscription_key
    }

    /// Replaces both sides with the given levels if `asset_id` is this
    /// book's key. Returns whether the snapshot was applied.
    ///
    /// Levels with a non-positive size are skipped; a repeated price keeps
    /// the last size given for it.
    pub fn apply_full_snapshot(
        &self,
        asset_id: &str,
        market: &str,
        bids: &[PriceLevel],
        asks: &[PriceLevel],
    ) -> bool {
        if asset_id != self.subscription_key {
            debug!(
                asset_id,
                key = %self.subscription_key,
                "Ignoring snapshot for another key"
            );
            return false;
        }

        let mut inner = self.inner.lock();
        inner.bids = collect_side(bids);
        inner.asks = collect_side(asks);
        inner.market = market.to_string();
        inner.last_update = Some(Utc::now());
        inner.emit_rows(&self.subscription_key);
        true
    }

    /// Applies the changes addressed to this book's key, in order. Returns
    /// how many were applied.
    ///
    /// A size of zero (or below) removes the level; any other size inserts
    /// the level or overwrites its size. Changes for other keys and unknown
    /// sides are skipped. Once the book holds a state, every message stamps
    /// it and emits its rows, even when no change was addressed to this key.
    /// An empty book is only started by a change it can apply.
    pub fn apply_delta(&self, market: &str, changes: &[PriceChange]) -> usize {
        let mut inner = self.inner.lock();
        let mut applied = 0;

        for change in changes {
            if change.asset_id != self.subscription_key {
                continue;
            }
            let Some(side) = DeltaSide::from_wire(&change.side) else {
                debug!(side = %change.side, "Ignoring change with unknown side");
                continue;
            };
            let levels = match side {
                DeltaSide::Buy => &mut inner.bids,
                DeltaSide::Sell => &mut inner.asks,
            };
            if change.size <= Decimal::ZERO {
                levels.remove(&change.price);
            } else {
                levels.insert(change.price, change.size);
            }
            applied += 1;
        }

        if applied > 0 || inner.last_update.is_some() {
            if inner.market.is_empty() && !market.is_empty() {
                inner.market = market.to_string();
            }
            inner.last_update = Some(Utc::now());
            inner.emit_rows(&self.subscription_key);
        }
        applied
    }

    /// Swaps the attached writer under the book lock.
    ///
    /// The previous writer, if any, is shut down (draining and closing its
    /// file) before `writer` is installed, so no row reaches the wrong file.
    /// Blocks for up to `timeout` while the old writer drains.
    ///
    /// # Errors
    ///
    /// Returns the old writer's shutdown error. The new writer is installed
    /// regardless.
    pub fn rebind_writer(
        &self,
        writer: Option<Arc<StorageWriter>>,
        timeout: Duration,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let outcome = match inner.writer.take() {
            Some(old) => old.shutdown(timeout),
            None => Ok(()),
        };
        inner.writer = writer;
        outcome
    }

    /// Returns the attached writer.
    pub fn writer(&self) -> Option<Arc<StorageWriter>> {
        self.inner.lock().writer.clone()
    }

    /// Highest bid price, or `None` while the bid side is empty.
    pub fn best_bid(&self) -> Option<Decimal> {
        self.inner.lock().best_bid()
    }

    /// Lowest ask price, or `None` while the ask side is empty.
    pub fn best_ask(&self) -> Option<Decimal> {
        self.inner.lock().best_ask()
    }

    /// Best bid and best ask read under one lock.
    pub fn top_of_book(&self) -> (Option<Decimal>, Option<Decimal>) {
        let inner = self.inner.lock();
        (inner.best_bid(), inner.best_ask())
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().last_update
    }

    /// Returns a consistent copy of both sides.
    pub fn snapshot(&self) -> BookSnapshot {
        let inner = self.inner.lock();
        BookSnapshot {
            market: inner.market.clone(),
            last_update: inner.last_update,
            bids: inner.bids.iter().rev().map(|(p, s)| (*p, *s)).collect(),
            asks: inner.asks.iter().map(|(p, s)| (*p, *s)).collect(),
        }
    }
}

fn collect_side(levels: &[PriceLevel]) -> BTreeMap<Decimal, Decimal> {
    levels
        .iter()
        .filter(|l| l.size > Decimal::ZERO)
        .map(|l| (l.price, l.size))
        .collect()
}
