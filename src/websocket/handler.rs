//! Incoming frame processing.

use tracing::{debug, warn};

use crate::book::BookState;
use crate::models::book::{FeedMessage, parse_feed_frame};

/// What happened to one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// A full snapshot replaced the book.
    Snapshot,
    /// A price-change batch applied this many changes to the book.
    Delta(usize),
    /// The frame was valid but not addressed to this book, or of no interest.
    Ignored,
    /// The frame could not be decoded and was dropped.
    Malformed,
}

/// Decodes one text frame and applies it to `book`.
///
/// Never fails: malformed frames are logged and dropped so the connection
/// keeps running.
pub fn handle_frame(book: &BookState, text: &str) -> FrameOutcome {
    let message = match parse_feed_frame(text) {
        Ok(Some(message)) => message,
        Ok(None) => return FrameOutcome::Ignored,
        Err(e) => {
            warn!(key = book.subscription_key(), error = %e, "Dropping malformed frame");
            return FrameOutcome::Malformed;
        }
    };

    match message {
        FeedMessage::Book(snapshot) => {
            let applied = book.apply_full_snapshot(
                &snapshot.asset_id,
                &snapshot.market,
                &snapshot.bids,
                &snapshot.asks,
            );
            if applied {
                debug!(
                    key = book.subscription_key(),
                    bids = snapshot.bids.len(),
                    asks = snapshot.asks.len(),
                    "Applied book snapshot"
                );
                FrameOutcome::Snapshot
            } else {
                FrameOutcome::Ignored
            }
        }
        FeedMessage::PriceChange(delta) => {
            match book.apply_delta(&delta.market, &delta.price_changes) {
                0 => FrameOutcome::Ignored,
                n => FrameOutcome::Delta(n),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn frames_drive_the_book() {
        let book = BookState::new("k1");

        let snapshot = r#"[{"event_type":"book","asset_id":"k1","market":"0xm",
            "bids":[{"price":"1.00","size":"10"}],"asks":[{"price":"1.02","size":"5"}]}]"#;
        assert_eq!(handle_frame(&book, snapshot), FrameOutcome::Snapshot);

        let delta = r#"{"event_type":"price_change","market":"0xm","price_changes":[
            {"asset_id":"k1","price":"1.00","size":"0","side":"BUY"},
            {"asset_id":"k2","price":"0.40","size":"3","side":"BUY"}]}"#;
        assert_eq!(handle_frame(&book, delta), FrameOutcome::Delta(1));

        assert_eq!(book.best_bid(), None);
        assert_eq!(book.best_ask(), Some(dec!(1.02)));
    }

    #[test]
    fn junk_is_dropped_without_touching_the_book() {
        let book = BookState::new("k1");
        assert_eq!(handle_frame(&book, "{oops"), FrameOutcome::Malformed);
        assert_eq!(
            handle_frame(&book, r#"{"event_type":"book","asset_id":7}"#),
            FrameOutcome::Malformed
        );
        assert_eq!(handle_frame(&book, "PONG"), FrameOutcome::Ignored);
        assert_eq!(
            handle_frame(&book, r#"{"event_type":"book","asset_id":"k9","bids":[],"asks":[]}"#),
            FrameOutcome::Ignored
        );
        assert!(book.last_update().is_none());
    }
}
