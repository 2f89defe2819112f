//! Shared models for the market-data feed and the instrument catalog.
//!
//! Contains channel definitions, the subscription request, the keepalive
//! payload, and the inbound frame types.

pub mod book;
pub mod instrument;

use serde::Serialize;

/// Literal keepalive payload sent on the feed.
pub const KEEPALIVE_PAYLOAD: &str = "PING";

/// Prefix of the feed's keepalive reply.
pub const KEEPALIVE_REPLY: &str = "PONG";

/// Feed channels a connection can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Public order-book updates keyed by subscription key.
    Market,
    /// Authenticated per-user updates keyed by market.
    User,
}

impl Channel {
    /// Returns the wire-format channel name, also used as the URL path segment.
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Market => "market",
            Channel::User => "user",
        }
    }
}

/// Credentials attached to a `user` channel subscription.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UserAuth {
    #[serde(rename = "apiKey")]
    pub api_key: Option<String>,
    pub secret: Option<String>,
    pub passphrase: Option<String>,
}

/// The single subscription message sent right after the connection opens.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SubscribeRequest {
    Market {
        assets_ids: Vec<String>,
        #[serde(rename = "type")]
        tpe: &'static str,
    },
    User {
        markets: Vec<String>,
        #[serde(rename = "type")]
        tpe: &'static str,
        auth: UserAuth,
    },
}

impl SubscribeRequest {
    /// Builds a `market` channel subscription for the given keys.
    pub fn market(keys: &[String]) -> Self {
        SubscribeRequest::Market {
            assets_ids: keys.to_vec(),
            tpe: Channel::Market.as_str(),
        }
    }

    /// Builds a `user` channel subscription for the given markets.
    pub fn user(markets: &[String], auth: UserAuth) -> Self {
        SubscribeRequest::User {
            markets: markets.to_vec(),
            tpe: Channel::User.as_str(),
            auth,
        }
    }

    /// Returns the channel this request subscribes to.
    pub fn channel(&self) -> Channel {
        match self {
            SubscribeRequest::Market { .. } => Channel::Market,
            SubscribeRequest::User { .. } => Channel::User,
        }
    }
}
