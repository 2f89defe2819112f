//! Live order-book recorder for rolling "Up or Down" prediction markets.
//!
//! For each tracked asset the [`session::Orchestrator`] discovers the window
//! that is live right now, subscribes to its order book over the market
//! WebSocket feed, reconstructs the book in a [`book::BookState`], and
//! streams every book state into one parquet file per session.

pub mod book;
pub mod config;
pub mod discovery;
pub mod error;
pub mod models;
pub mod session;
pub mod storage;
pub mod websocket;

pub use error::{Result, RollbookError};
