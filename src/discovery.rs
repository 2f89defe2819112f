//! Instrument discovery and subscription-key resolution.
//!
//! [`MarketCatalog`] is the seam the orchestrator polls: it lists the
//! current "Up or Down" windows for an asset and turns a settlement
//! condition into the feed keys for it. [`GammaCatalog`] is the REST
//! implementation.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};

use crate::config::CatalogConfig;
use crate::models::instrument::{
    CatalogEvent, InstrumentWindow, ResolvedMarket, SOURCE_TZ, UP_OR_DOWN_MARKER,
    parse_window_title,
};
use crate::{Result, RollbookError};

/// How far back the catalog query reaches for still-open events.
const LOOKBACK_DAYS: i64 = 8;

/// Source of instrument windows and their subscription keys.
#[async_trait]
pub trait MarketCatalog: Send + Sync {
    /// Lists the windows currently published for `asset`.
    async fn list_windows(&self, asset: &str, now: DateTime<Utc>) -> Result<Vec<InstrumentWindow>>;

    /// Returns the tradable keys of a settlement condition, in catalog order.
    async fn resolve_subscription_keys(&self, condition_id: &str) -> Result<Vec<String>>;
}

/// Resolves the key to record for a condition: the first of exactly two.
///
/// # Errors
///
/// Returns [`RollbookError::SubscriptionKeys`] if the catalog does not
/// return exactly two keys, or the catalog's own error.
pub async fn resolve_primary_key(
    catalog: &dyn MarketCatalog,
    condition_id: &str,
) -> Result<String> {
    let keys = catalog.resolve_subscription_keys(condition_id).await?;
    match <[String; 2]>::try_from(keys) {
        Ok([primary, _]) => Ok(primary),
        Err(keys) => Err(RollbookError::SubscriptionKeys {
            condition_id: condition_id.to_string(),
            count: keys.len(),
        }),
    }
}

/// Returns the first tracked asset named in `title`.
pub fn attribute_asset<'a>(title: &str, tracked: &'a [String]) -> Option<&'a str> {
    tracked
        .iter()
        .find(|asset| title.contains(asset.as_str()))
        .map(String::as_str)
}

/// Builds the windows of `asset` from raw catalog events.
///
/// Only "Up or Down" events whose first matching tracked asset is `asset`
/// are kept. Events whose title does not carry a parsable range are
/// skipped with a warning.
pub fn windows_from_events(
    events: &[CatalogEvent],
    asset: &str,
    tracked: &[String],
    year: i32,
) -> Vec<InstrumentWindow> {
    events
        .iter()
        .filter_map(|event| {
            let title = event.display_name()?;
            if !title.contains(UP_OR_DOWN_MARKER)
                || attribute_asset(title, tracked) != Some(asset)
            {
                return None;
            }
            let Some((start, end)) = parse_window_title(title, year) else {
                warn!(title, "Skipping event without a parsable window");
                return None;
            };
            Some(InstrumentWindow {
                id: event.id_string(),
                name: title.to_string(),
                asset: asset.to_string(),
                start,
                end,
                status: if event.active { "active" } else { "closed" }.to_string(),
                condition_ids: event
                    .markets
                    .iter()
                    .filter_map(|m| m.condition_id.clone())
                    .collect(),
                creation_date: event.start_date.clone(),
                closing_date: event.end_date.clone(),
            })
        })
        .collect()
}

/// Catalog backed by the Gamma events API and the CLOB markets API.
pub struct GammaCatalog {
    client: reqwest::Client,
    config: CatalogConfig,
    tracked: Vec<String>,
}

impl GammaCatalog {
    /// Creates a catalog client attributing events among `tracked` assets.
    ///
    /// # Errors
    ///
    /// Returns [`RollbookError::Http`] if the HTTP client cannot be built.
    pub fn new(config: CatalogConfig, tracked: Vec<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            config,
            tracked,
        })
    }

    async fn fetch_events(&self, now: DateTime<Utc>) -> Result<Vec<CatalogEvent>> {
        let url = format!("{}/events", self.config.gamma_url.trim_end_matches('/'));
        let since = (now - ChronoDuration::days(LOOKBACK_DAYS))
            .format("%Y-%m-%d")
            .to_string();

        let response = self
            .client
            .get(&url)
            .query(&[
                ("closed", "false".to_string()),
                ("start_date_min", since),
                ("limit", self.config.limit.to_string()),
                ("tag_id", self.config.window.tag_id().to_string()),
            ])
            .send()
            .await?;
        let response = response.error_for_status()?;
        let body = response.text().await?;
        serde_json::from_str(&body)
            .map_err(|e| RollbookError::Discovery(format!("unexpected events payload: {e}")))
    }
}

#[async_trait]
impl MarketCatalog for GammaCatalog {
    async fn list_windows(&self, asset: &str, now: DateTime<Utc>) -> Result<Vec<InstrumentWindow>> {
        let events = self.fetch_events(now).await?;
        let year = now.with_timezone(&SOURCE_TZ).year();
        let windows = windows_from_events(&events, asset, &self.tracked, year);
        info!(
            asset,
            window = %self.config.window,
            events = events.len(),
            windows = windows.len(),
            "Fetched instrument windows"
        );
        Ok(windows)
    }

    async fn resolve_subscription_keys(&self, condition_id: &str) -> Result<Vec<String>> {
        let url = format!(
            "{}/markets/{}",
            self.config.clob_url.trim_end_matches('/'),
            condition_id
        );
        let response = self.client.get(&url).send().await?.error_for_status()?;
        let market: ResolvedMarket = response.json().await?;
        debug!(condition_id, tokens = market.tokens.len(), "Resolved condition");
        Ok(market.tokens.into_iter().map(|t| t.token_id).collect())
    }
}
