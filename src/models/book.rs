//! Order book frames received on the `market` channel.
//!
//! A frame is either a one-element list wrapping a full book, or a single
//! object whose `event_type` is `"book"` or `"price_change"`. Anything else
//! is ignored.

use rust_decimal::Decimal;
use serde::Deserialize;

use super::KEEPALIVE_REPLY;
use crate::{Result, RollbookError};

/// A full book snapshot for one subscription key.
#[derive(Debug, Clone, Deserialize)]
pub struct BookMessage {
    #[serde(default)]
    pub event_type: Option<String>,
    pub asset_id: String,
    #[serde(default)]
    pub market: String,
    #[serde(default)]
    pub bids: Vec<PriceLevel>,
    #[serde(default)]
    pub asks: Vec<PriceLevel>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
}

/// A single price level as sent on the wire (prices and sizes are strings).
#[derive(Debug, Clone, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

/// A batch of incremental level changes, applied in order.
#[derive(Debug, Clone, Deserialize)]
pub struct PriceChangeMessage {
    #[serde(default)]
    pub market: String,
    #[serde(default)]
    pub price_changes: Vec<PriceChange>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// One level change. `size` is the new aggregate size at `price`; zero
/// removes the level.
#[derive(Debug, Clone, Deserialize)]
pub struct PriceChange {
    pub asset_id: String,
    pub price: Decimal,
    pub size: Decimal,
    /// `BUY` for the bid side, `SELL` for the ask side.
    pub side: String,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub best_bid: Option<String>,
    #[serde(default)]
    pub best_ask: Option<String>,
}

/// A decoded inbound frame.
#[derive(Debug, Clone)]
pub enum FeedMessage {
    Book(BookMessage),
    PriceChange(PriceChangeMessage),
}

/// Decodes one text frame.
///
/// Returns `Ok(None)` for keepalive replies, empty frames, and well-formed
/// JSON of an unknown shape or discriminator.
///
/// # Errors
///
/// Returns [`RollbookError::Json`] if the frame is not JSON, and
/// [`RollbookError::MalformedMessage`] if it claims to be a book or price
/// change but its fields do not match.
pub fn parse_feed_frame(text: &str) -> Result<Option<FeedMessage>> {
    let text = text.trim();
    if text.is_empty() || text.starts_with(KEEPALIVE_REPLY) {
        return Ok(None);
    }

    let value: serde_json::Value = serde_json::from_str(text)?;

    match value {
        serde_json::Value::Array(mut items) => {
            if items.is_empty() {
                return Ok(None);
            }
            let book = decode::<BookMessage>(items.swap_remove(0), "book")?;
            Ok(Some(FeedMessage::Book(book)))
        }
        serde_json::Value::Object(_) => {
            let event_type = value
                .get("event_type")
                .and_then(|t| t.as_str())
                .map(String::from);
            match event_type.as_deref() {
                Some("book") => Ok(Some(FeedMessage::Book(decode(value, "book")?))),
                Some("price_change") => Ok(Some(FeedMessage::PriceChange(decode(
                    value,
                    "price_change",
                )?))),
                _ => Ok(None),
            }
        }
        _ => Ok(None),
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: serde_json::Value, kind: &str) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| RollbookError::MalformedMessage(format!("{kind} frame: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn list_wrapped_book_is_a_snapshot() {
        let frame = r#"[{"event_type":"book","asset_id":"k1","market":"0xm",
            "bids":[{"price":"0.48","size":"30"}],"asks":[{"price":"0.52","size":"12.5"}]}]"#;
        let Some(FeedMessage::Book(book)) = parse_feed_frame(frame).unwrap() else {
            panic!("expected a book");
        };
        assert_eq!(book.asset_id, "k1");
        assert_eq!(book.market, "0xm");
        assert_eq!(book.bids[0].price, dec!(0.48));
        assert_eq!(book.asks[0].size, dec!(12.5));
    }

    #[test]
    fn price_change_object_decodes_in_order() {
        let frame = r#"{"event_type":"price_change","market":"0xm","price_changes":[
            {"asset_id":"k1","price":"0.5","size":"0","side":"BUY"},
            {"asset_id":"k2","price":"0.6","size":"10","side":"SELL"}]}"#;
        let Some(FeedMessage::PriceChange(msg)) = parse_feed_frame(frame).unwrap() else {
            panic!("expected a price change");
        };
        assert_eq!(msg.price_changes.len(), 2);
        assert_eq!(msg.price_changes[0].size, Decimal::ZERO);
        assert_eq!(msg.price_changes[1].side, "SELL");
    }

    #[test]
    fn ignores_keepalive_and_unknown_shapes() {
        assert!(parse_feed_frame("PONG").unwrap().is_none());
        assert!(parse_feed_frame("").unwrap().is_none());
        assert!(parse_feed_frame("[]").unwrap().is_none());
        assert!(parse_feed_frame("42").unwrap().is_none());
        assert!(
            parse_feed_frame(r#"{"event_type":"last_trade_price","asset_id":"k1"}"#)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(matches!(
            parse_feed_frame("{not json"),
            Err(RollbookError::Json(_))
        ));
        assert!(matches!(
            parse_feed_frame(r#"{"event_type":"book","bids":"nope"}"#),
            Err(RollbookError::MalformedMessage(_))
        ));
    }
}
