//! Core data models for the market cache
//!
//! This module contains the time-series types served by the API, the validated
//! query that identifies a series, and the upstream provider client.

pub mod market;
pub mod query;

pub use market::{MarketDataClient, MarketDataError, SeriesFetcher};
pub use query::{Interval, QueryError, SeriesParams, SeriesQuery};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single OHLC point in a time series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Start of the bar, in UTC
    pub timestamp: DateTime<Utc>,
    /// Opening price
    pub open: f64,
    /// Highest traded price
    pub high: f64,
    /// Lowest traded price
    pub low: f64,
    /// Closing price
    pub close: f64,
    /// Traded volume
    pub volume: u64,
}
