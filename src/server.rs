//! HTTP service boundary
//!
//! Maps `GET /api/series` requests to cache keys and upstream loads, and maps cache
//! results and failures to JSON responses.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::cache::{loader_fn, ExpiringCache};
use crate::data::{Candle, Interval, MarketDataError, QueryError, SeriesFetcher, SeriesParams, SeriesQuery};

/// Cache of parsed series keyed by [`SeriesQuery::cache_key`]
pub type SeriesCache = ExpiringCache<Vec<Candle>, MarketDataError>;

/// Shared state for request handlers
#[derive(Clone)]
pub struct AppState {
    pub cache: SeriesCache,
    pub fetcher: Arc<dyn SeriesFetcher>,
}

impl AppState {
    pub fn new(cache: SeriesCache, fetcher: Arc<dyn SeriesFetcher>) -> Self {
        Self { cache, fetcher }
    }
}

/// Errors surfaced to HTTP clients
#[derive(Debug, Error)]
pub enum ApiError {
    /// Parameters failed validation
    #[error("{0}")]
    InvalidParameters(#[from] QueryError),

    /// The query string could not be decoded at all
    #[error("Malformed query string: {0}")]
    MalformedQuery(String),

    /// The upstream fetch failed
    #[error("Upstream fetch failed: {0}")]
    Upstream(Arc<MarketDataError>),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::InvalidParameters(_) | ApiError::MalformedQuery(_) => {
                (StatusCode::BAD_REQUEST, "INVALID_PARAMETERS")
            }
            ApiError::Upstream(_) => (StatusCode::INTERNAL_SERVER_ERROR, "UPSTREAM_ERROR"),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": self.to_string()
            }
        }));

        (status, body).into_response()
    }
}

/// Body of a successful series response
#[derive(Debug, Serialize)]
struct SeriesResponse<'a> {
    symbol: &'a str,
    interval: Interval,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cached_at: Option<DateTime<Utc>>,
    points: &'a [Candle],
}

/// `GET /api/series?symbol=&interval=&start=&end=`
async fn get_series(
    State(state): State<AppState>,
    params: Result<Query<SeriesParams>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(params) = params.map_err(|e| ApiError::MalformedQuery(e.body_text()))?;
    let query = SeriesQuery::from_params(params)?;
    let key = query.cache_key();

    let fetcher = Arc::clone(&state.fetcher);
    let bound = query.clone();
    let loader = loader_fn(move || {
        let fetcher = Arc::clone(&fetcher);
        let query = bound.clone();
        async move { fetcher.fetch_series(&query).await }
    });

    let points = state.cache.fetch_or_load(&key, loader).await.map_err(|err| {
        tracing::warn!(key = %key, error = %err, "series load failed");
        ApiError::Upstream(err)
    })?;

    // Only report a timestamp if the stored entry is the one being returned.
    let cached_at = state
        .cache
        .get_entry(&key)
        .filter(|entry| Arc::ptr_eq(entry.data(), &points))
        .map(|entry| entry.cached_at());

    let body = SeriesResponse {
        symbol: &query.symbol,
        interval: query.interval,
        start: query.start,
        end: query.end,
        cached_at,
        points: &points,
    };
    Ok(Json(body).into_response())
}

/// `GET /health`
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "cached_keys": state.cache.len()
    }))
}

/// Builds the application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/series", get(get_series))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the API on `listener` until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "listening");
    }
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    const SERIES_URI: &str =
        "/api/series?symbol=aapl&interval=1min&start=1700000000&end=1700003600";

    struct StubFetcher {
        calls: AtomicUsize,
        fail: bool,
    }

    impl StubFetcher {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl SeriesFetcher for StubFetcher {
        async fn fetch_series(&self, query: &SeriesQuery) -> Result<Vec<Candle>, MarketDataError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(MarketDataError::RateLimited("slow down".to_string()));
            }
            Ok(vec![Candle {
                timestamp: query.start,
                open: 1.0,
                high: 2.0,
                low: 0.5,
                close: 1.5,
                volume: 10,
            }])
        }
    }

    fn create_test_state(fetcher: Arc<StubFetcher>) -> AppState {
        let cache = ExpiringCache::new(Duration::from_secs(600), Duration::from_secs(60));
        AppState::new(cache, fetcher)
    }

    async fn send(state: AppState, uri: &str) -> (StatusCode, Value) {
        let response = create_router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_series_returns_points() {
        let fetcher = StubFetcher::new(false);
        let state = create_test_state(Arc::clone(&fetcher));

        let (status, body) = send(state.clone(), SERIES_URI).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["symbol"], "AAPL");
        assert_eq!(body["interval"], "1min");
        assert_eq!(body["points"].as_array().unwrap().len(), 1);
        assert_eq!(body["points"][0]["close"], 1.5);
        assert!(body["cached_at"].is_string());
        assert!(state.cache.get("AAPL-1min-1700000000-1700003600").is_some());
    }

    #[tokio::test]
    async fn test_second_request_is_served_from_cache() {
        let fetcher = StubFetcher::new(false);
        let state = create_test_state(Arc::clone(&fetcher));

        let (first, _) = send(state.clone(), SERIES_URI).await;
        // Same parameters in a different order and case map to the same key.
        let (second, _) = send(
            state.clone(),
            "/api/series?end=1700003600&start=1700000000&interval=1min&symbol=AAPL",
        )
        .await;

        assert_eq!(first, StatusCode::OK);
        assert_eq!(second, StatusCode::OK);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_parameter_is_rejected_before_cache() {
        let fetcher = StubFetcher::new(false);
        let state = create_test_state(Arc::clone(&fetcher));

        let (status, body) =
            send(state.clone(), "/api/series?symbol=AAPL&interval=1min&start=1700000000").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_PARAMETERS");
        assert!(body["error"]["message"].as_str().unwrap().contains("end"));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert!(state.cache.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_interval_is_rejected() {
        let fetcher = StubFetcher::new(false);
        let state = create_test_state(Arc::clone(&fetcher));

        let (status, _) = send(
            state,
            "/api/series?symbol=AAPL&interval=7min&start=1700000000&end=1700003600",
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fractional_second_bound_is_rejected() {
        let fetcher = StubFetcher::new(false);
        let state = create_test_state(Arc::clone(&fetcher));

        let (status, body) = send(
            state.clone(),
            "/api/series?symbol=AAPL&interval=1min&start=2023-11-14T22:13:20.5Z&end=1700003600",
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_PARAMETERS");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert!(state.cache.is_empty());
    }

    #[tokio::test]
    async fn test_upstream_failure_returns_server_error_and_caches_nothing() {
        let fetcher = StubFetcher::new(true);
        let state = create_test_state(Arc::clone(&fetcher));

        let (status, body) = send(state.clone(), SERIES_URI).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["code"], "UPSTREAM_ERROR");
        assert!(body["error"]["message"].as_str().unwrap().contains("slow down"));
        assert!(state.cache.is_empty());

        // The failure is not cached; the next request tries upstream again.
        send(state, SERIES_URI).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_health_reports_cached_keys() {
        let fetcher = StubFetcher::new(false);
        let state = create_test_state(fetcher);

        send(state.clone(), SERIES_URI).await;
        let (status, body) = send(state, "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["cached_keys"], 1);
    }
}
