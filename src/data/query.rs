//! Series query parsing and cache key derivation
//!
//! Raw request parameters arrive as optional strings. They are validated into a
//! [`SeriesQuery`] before the cache is ever consulted, and the query renders the
//! cache key that identifies its series.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest symbol accepted by the provider
const MAX_SYMBOL_LEN: usize = 16;

/// Errors raised while validating request parameters
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// A required parameter was not supplied
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),

    /// The symbol is empty, too long, or has unsupported characters
    #[error("Invalid symbol: '{0}'")]
    InvalidSymbol(String),

    /// The interval is not one the provider understands
    #[error("Invalid interval: '{0}'. Valid intervals: 1min, 5min, 15min, 30min, 60min, daily")]
    InvalidInterval(String),

    /// A time bound could not be parsed
    #[error("Invalid time for '{field}': '{value}'. Use RFC 3339 or Unix seconds")]
    InvalidTime { field: &'static str, value: String },

    /// A time bound carries a sub-second part
    #[error("Invalid time for '{0}': fractional seconds are not supported")]
    FractionalSeconds(&'static str),

    /// The time range is empty or reversed
    #[error("Invalid range: start must be before end")]
    EmptyRange,
}

/// Bar size of a time series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1min")]
    OneMinute,
    #[serde(rename = "5min")]
    FiveMinutes,
    #[serde(rename = "15min")]
    FifteenMinutes,
    #[serde(rename = "30min")]
    ThirtyMinutes,
    #[serde(rename = "60min")]
    SixtyMinutes,
    #[serde(rename = "daily")]
    Daily,
}

impl Interval {
    /// The provider's name for this interval
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::OneMinute => "1min",
            Interval::FiveMinutes => "5min",
            Interval::FifteenMinutes => "15min",
            Interval::ThirtyMinutes => "30min",
            Interval::SixtyMinutes => "60min",
            Interval::Daily => "daily",
        }
    }

    /// Whether this interval is served by the intraday endpoint
    pub fn is_intraday(&self) -> bool {
        !matches!(self, Interval::Daily)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "1min" => Ok(Interval::OneMinute),
            "5min" => Ok(Interval::FiveMinutes),
            "15min" => Ok(Interval::FifteenMinutes),
            "30min" => Ok(Interval::ThirtyMinutes),
            "60min" => Ok(Interval::SixtyMinutes),
            "daily" => Ok(Interval::Daily),
            _ => Err(QueryError::InvalidInterval(s.to_string())),
        }
    }
}

/// Raw query-string parameters, before validation
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SeriesParams {
    pub symbol: Option<String>,
    pub interval: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
}

/// Validated logical parameters of a time-series request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesQuery {
    /// Upper-cased instrument symbol
    pub symbol: String,
    /// Bar size
    pub interval: Interval,
    /// Inclusive start of the range
    pub start: DateTime<Utc>,
    /// Inclusive end of the range
    pub end: DateTime<Utc>,
}

impl SeriesQuery {
    /// Creates a query from already-typed values
    ///
    /// Bounds must be whole seconds so the query matches its cache key exactly.
    ///
    /// # Returns
    /// * `Err(QueryError)` if the symbol is malformed, a bound has fractional
    ///   seconds, or the range is empty
    pub fn new(
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Self, QueryError> {
        let symbol = normalize_symbol(symbol)?;
        if start.timestamp_subsec_nanos() != 0 {
            return Err(QueryError::FractionalSeconds("start"));
        }
        if end.timestamp_subsec_nanos() != 0 {
            return Err(QueryError::FractionalSeconds("end"));
        }
        if start >= end {
            return Err(QueryError::EmptyRange);
        }
        Ok(Self {
            symbol,
            interval,
            start,
            end,
        })
    }

    /// Validates raw request parameters
    ///
    /// Every parameter is required. Times accept RFC 3339 (`2024-01-02T15:00:00Z`)
    /// or integer Unix seconds.
    pub fn from_params(params: SeriesParams) -> Result<Self, QueryError> {
        let symbol = params
            .symbol
            .ok_or(QueryError::MissingParameter("symbol"))?;
        let interval: Interval = params
            .interval
            .ok_or(QueryError::MissingParameter("interval"))?
            .parse()?;
        let start = params.start.ok_or(QueryError::MissingParameter("start"))?;
        let end = params.end.ok_or(QueryError::MissingParameter("end"))?;

        let start = parse_time("start", &start)?;
        let end = parse_time("end", &end)?;

        Self::new(&symbol, interval, start, end)
    }

    /// Renders the cache key for this query
    ///
    /// Format: `{SYMBOL}-{interval}-{start}-{end}` with Unix-second bounds. Only the
    /// symbol may contain `-`; the last three fields never do, so two distinct
    /// queries can never render the same key.
    pub fn cache_key(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.symbol,
            self.interval,
            self.start.timestamp(),
            self.end.timestamp()
        )
    }
}

fn normalize_symbol(raw: &str) -> Result<String, QueryError> {
    let symbol = raw.trim().to_uppercase();
    let valid = !symbol.is_empty()
        && symbol.len() <= MAX_SYMBOL_LEN
        && symbol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    if valid {
        Ok(symbol)
    } else {
        Err(QueryError::InvalidSymbol(raw.to_string()))
    }
}

fn parse_time(field: &'static str, value: &str) -> Result<DateTime<Utc>, QueryError> {
    let trimmed = value.trim();
    let invalid = || QueryError::InvalidTime {
        field,
        value: value.to_string(),
    };

    if let Ok(secs) = trimmed.parse::<i64>() {
        return Utc.timestamp_opt(secs, 0).single().ok_or_else(invalid);
    }

    DateTime::parse_from_rfc3339(trimmed)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(symbol: &str, interval: &str, start: &str, end: &str) -> SeriesParams {
        SeriesParams {
            symbol: Some(symbol.to_string()),
            interval: Some(interval.to_string()),
            start: Some(start.to_string()),
            end: Some(end.to_string()),
        }
    }

    #[test]
    fn test_cache_key_format() {
        let query =
            SeriesQuery::from_params(params("AAPL", "1min", "1700000000", "1700003600")).unwrap();
        assert_eq!(query.cache_key(), "AAPL-1min-1700000000-1700003600");
    }

    #[test]
    fn test_rfc3339_and_unix_seconds_give_same_key() {
        let a = SeriesQuery::from_params(params(
            "MSFT",
            "5min",
            "2023-11-14T22:13:20Z",
            "2023-11-14T23:13:20+00:00",
        ))
        .unwrap();
        let b =
            SeriesQuery::from_params(params("MSFT", "5min", "1700000000", "1700003600")).unwrap();
        assert_eq!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn test_symbol_is_normalized() {
        let query =
            SeriesQuery::from_params(params("  aapl ", "daily", "1700000000", "1700086400"))
                .unwrap();
        assert_eq!(query.symbol, "AAPL");
    }

    #[test]
    fn test_keys_differ_when_any_parameter_differs() {
        let base = params("AAPL", "1min", "1700000000", "1700003600");
        let variants = [
            params("MSFT", "1min", "1700000000", "1700003600"),
            params("AAPL", "5min", "1700000000", "1700003600"),
            params("AAPL", "1min", "1700000001", "1700003600"),
            params("AAPL", "1min", "1700000000", "1700003601"),
        ];
        let base_key = SeriesQuery::from_params(base).unwrap().cache_key();
        for variant in variants {
            let key = SeriesQuery::from_params(variant).unwrap().cache_key();
            assert_ne!(key, base_key);
        }
    }

    #[test]
    fn test_hyphenated_symbol_does_not_collide() {
        // "BRK-B" with one range must not alias "BRK" with a shifted field layout.
        let a = SeriesQuery::from_params(params("BRK-B", "1min", "1700000000", "1700003600"))
            .unwrap()
            .cache_key();
        let b = SeriesQuery::from_params(params("BRK", "1min", "1700000000", "1700003600"))
            .unwrap()
            .cache_key();
        assert_eq!(a, "BRK-B-1min-1700000000-1700003600");
        assert_ne!(a, b);
    }

    #[test]
    fn test_missing_parameter() {
        let mut p = params("AAPL", "1min", "1700000000", "1700003600");
        p.end = None;
        assert_eq!(
            SeriesQuery::from_params(p).unwrap_err(),
            QueryError::MissingParameter("end")
        );
        assert_eq!(
            SeriesQuery::from_params(SeriesParams::default()).unwrap_err(),
            QueryError::MissingParameter("symbol")
        );
    }

    #[test]
    fn test_invalid_symbol() {
        for bad in ["", "   ", "AA PL", "AAPL;DROP", "ABCDEFGHIJKLMNOPQ"] {
            let result = SeriesQuery::from_params(params(bad, "1min", "1700000000", "1700003600"));
            assert!(
                matches!(result, Err(QueryError::InvalidSymbol(_))),
                "expected '{}' to be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_invalid_interval() {
        let err = SeriesQuery::from_params(params("AAPL", "2min", "1700000000", "1700003600"))
            .unwrap_err();
        assert!(err.to_string().contains("2min"));
    }

    #[test]
    fn test_invalid_time() {
        let err = SeriesQuery::from_params(params("AAPL", "1min", "yesterday", "1700003600"))
            .unwrap_err();
        assert_eq!(
            err,
            QueryError::InvalidTime {
                field: "start",
                value: "yesterday".to_string()
            }
        );
    }

    #[test]
    fn test_fractional_seconds_are_rejected() {
        // Sub-second bounds would filter differently from the whole-second query
        // sharing their key.
        let err = SeriesQuery::from_params(params(
            "AAPL",
            "1min",
            "2023-11-14T22:13:20.5Z",
            "2023-11-14T23:13:20Z",
        ))
        .unwrap_err();
        assert_eq!(err, QueryError::FractionalSeconds("start"));

        let err = SeriesQuery::from_params(params(
            "AAPL",
            "1min",
            "2023-11-14T22:13:20Z",
            "2023-11-14T23:13:20.000001Z",
        ))
        .unwrap_err();
        assert_eq!(err, QueryError::FractionalSeconds("end"));

        // A zero fraction is still a whole second.
        let whole = SeriesQuery::from_params(params(
            "AAPL",
            "1min",
            "2023-11-14T22:13:20.000Z",
            "2023-11-14T23:13:20Z",
        ))
        .unwrap();
        assert_eq!(whole.cache_key(), "AAPL-1min-1700000000-1700003600");
    }

    #[test]
    fn test_empty_or_reversed_range() {
        for (start, end) in [("1700000000", "1700000000"), ("1700003600", "1700000000")] {
            let err = SeriesQuery::from_params(params("AAPL", "1min", start, end)).unwrap_err();
            assert_eq!(err, QueryError::EmptyRange);
        }
    }

    #[test]
    fn test_interval_round_trips_through_display() {
        for interval in [
            Interval::OneMinute,
            Interval::FiveMinutes,
            Interval::FifteenMinutes,
            Interval::ThirtyMinutes,
            Interval::SixtyMinutes,
            Interval::Daily,
        ] {
            assert_eq!(interval.to_string().parse::<Interval>().unwrap(), interval);
        }
        assert!(!Interval::Daily.is_intraday());
        assert!(Interval::OneMinute.is_intraday());
    }
}
