//! Alpha Vantage market data client
//!
//! This module fetches OHLC time series from an Alpha Vantage compatible API and
//! parses them into [`Candle`] points restricted to the requested range.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use super::{Candle, SeriesQuery};

/// Base URL for the Alpha Vantage API
pub const ALPHA_VANTAGE_BASE_URL: &str = "https://www.alphavantage.co/query";

/// Errors that can occur when fetching market data
#[derive(Debug, Error)]
pub enum MarketDataError {
    /// HTTP request failed or timed out
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Upstream answered with a non-success status
    #[error("Upstream returned HTTP {0}")]
    Status(u16),

    /// Failed to parse JSON response
    #[error("Failed to parse JSON response: {0}")]
    Parse(#[from] serde_json::Error),

    /// The provider rejected the request
    #[error("Provider error: {0}")]
    Provider(String),

    /// The provider is throttling this API key
    #[error("Rate limited by provider: {0}")]
    RateLimited(String),

    /// Missing expected field in response
    #[error("Missing expected field in response: {0}")]
    MissingField(String),

    /// A field was present but could not be interpreted
    #[error("Invalid value in response: {0}")]
    InvalidValue(String),
}

/// Anything that can produce a time series for a query
///
/// The HTTP layer depends on this trait rather than on [`MarketDataClient`] so the
/// upstream can be replaced in tests.
#[async_trait]
pub trait SeriesFetcher: Send + Sync {
    /// Fetch the points of `query`, oldest first
    async fn fetch_series(&self, query: &SeriesQuery) -> Result<Vec<Candle>, MarketDataError>;
}

/// Client for fetching time series from Alpha Vantage
#[derive(Debug, Clone)]
pub struct MarketDataClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl MarketDataClient {
    /// Create a new client whose requests are bounded by `timeout`
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Result<Self, MarketDataError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, api_key))
    }

    /// Create a new client with a custom HTTP client
    pub fn with_client(client: Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: ALPHA_VANTAGE_BASE_URL.to_string(),
        }
    }

    /// Point the client at a different API host
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Fetch the series described by `query`
    ///
    /// # Returns
    /// * `Ok(Vec<Candle>)` - Points inside `[start, end]`, oldest first
    /// * `Err(MarketDataError)` - If the request fails or the response has the wrong shape
    pub async fn fetch_series(&self, query: &SeriesQuery) -> Result<Vec<Candle>, MarketDataError> {
        let mut params = vec![
            ("symbol", query.symbol.clone()),
            ("outputsize", "full".to_string()),
            ("apikey", self.api_key.clone()),
        ];
        if query.interval.is_intraday() {
            params.push(("function", "TIME_SERIES_INTRADAY".to_string()));
            params.push(("interval", query.interval.to_string()));
        } else {
            params.push(("function", "TIME_SERIES_DAILY".to_string()));
        }

        tracing::debug!(symbol = %query.symbol, interval = %query.interval, "fetching series from upstream");

        let response = self.client.get(&self.base_url).query(&params).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MarketDataError::Status(status.as_u16()));
        }
        let text = response.text().await?;

        parse_series(&text, query)
    }
}

#[async_trait]
impl SeriesFetcher for MarketDataClient {
    async fn fetch_series(&self, query: &SeriesQuery) -> Result<Vec<Candle>, MarketDataError> {
        MarketDataClient::fetch_series(self, query).await
    }
}

/// One bar as the provider encodes it
#[derive(Debug, Deserialize)]
struct RawBar {
    #[serde(rename = "1. open")]
    open: String,
    #[serde(rename = "2. high")]
    high: String,
    #[serde(rename = "3. low")]
    low: String,
    #[serde(rename = "4. close")]
    close: String,
    #[serde(rename = "5. volume")]
    volume: String,
}

/// Parse a provider response body into candles inside the query's range
fn parse_series(body: &str, query: &SeriesQuery) -> Result<Vec<Candle>, MarketDataError> {
    let root: HashMap<String, Value> = serde_json::from_str(body)?;

    if let Some(message) = root.get("Error Message").and_then(Value::as_str) {
        return Err(MarketDataError::Provider(message.to_string()));
    }
    for throttle_key in ["Note", "Information"] {
        if let Some(message) = root.get(throttle_key).and_then(Value::as_str) {
            return Err(MarketDataError::RateLimited(message.to_string()));
        }
    }

    let tz = provider_time_zone(&root)?;

    let series = root
        .iter()
        .find(|(key, _)| key.starts_with("Time Series"))
        .map(|(_, value)| value)
        .ok_or_else(|| MarketDataError::MissingField("Time Series".to_string()))?;
    let bars: HashMap<String, RawBar> = serde_json::from_value(series.clone())?;

    let mut candles = Vec::with_capacity(bars.len());
    for (stamp, bar) in bars {
        let timestamp = parse_timestamp(&stamp, tz)?;
        if timestamp < query.start || timestamp > query.end {
            continue;
        }
        candles.push(Candle {
            timestamp,
            open: parse_price("open", &bar.open)?,
            high: parse_price("high", &bar.high)?,
            low: parse_price("low", &bar.low)?,
            close: parse_price("close", &bar.close)?,
            volume: bar
                .volume
                .trim()
                .parse()
                .map_err(|_| MarketDataError::InvalidValue(format!("volume '{}'", bar.volume)))?,
        });
    }

    candles.sort_by_key(|c| c.timestamp);
    Ok(candles)
}

/// Reads the `N. Time Zone` entry from `Meta Data`
fn provider_time_zone(root: &HashMap<String, Value>) -> Result<Tz, MarketDataError> {
    let meta = root
        .get("Meta Data")
        .and_then(Value::as_object)
        .ok_or_else(|| MarketDataError::MissingField("Meta Data".to_string()))?;
    let name = meta
        .iter()
        .find(|(key, _)| key.ends_with("Time Zone"))
        .and_then(|(_, value)| value.as_str())
        .ok_or_else(|| MarketDataError::MissingField("Time Zone".to_string()))?;
    name.parse::<Tz>()
        .map_err(|_| MarketDataError::InvalidValue(format!("time zone '{}'", name)))
}

/// Parse "2024-01-02 15:30:00" or "2024-01-02" in the provider's zone to UTC
fn parse_timestamp(stamp: &str, tz: Tz) -> Result<DateTime<Utc>, MarketDataError> {
    let naive = NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| {
            NaiveDate::parse_from_str(stamp, "%Y-%m-%d").map(|d| d.and_time(Default::default()))
        })
        .map_err(|_| MarketDataError::InvalidValue(format!("timestamp '{}'", stamp)))?;

    tz.from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| MarketDataError::InvalidValue(format!("timestamp '{}'", stamp)))
}

fn parse_price(field: &str, raw: &str) -> Result<f64, MarketDataError> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| MarketDataError::InvalidValue(format!("{} '{}'", field, raw)))
}
