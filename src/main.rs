//! Market Cache - serve market time series over HTTP
//!
//! Fetches OHLC series from Alpha Vantage on demand, keeps them in a TTL cache
//! that refreshes itself in the background, and serves them as JSON.

use std::process;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use marketcache::cache::ExpiringCache;
use marketcache::cli::{Cli, ServerConfig};
use marketcache::data::MarketDataClient;
use marketcache::refresh::RefreshHandle;
use marketcache::server::{self, AppState};

/// Sets up the tracing subscriber, honouring `RUST_LOG` when present.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "marketcache=info,tower_http=info".into()),
        )
        .init();
}

/// Resolves when the process receives Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = match ServerConfig::from_cli(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(2);
        }
    };

    init_tracing();

    if config.refresh.enabled && config.refresh.interval > config.ttl {
        warn!(
            ttl_secs = config.ttl.as_secs(),
            refresh_interval_secs = config.refresh.interval.as_secs(),
            "refresh interval exceeds TTL; entries will expire before they are refreshed"
        );
    }

    let client = MarketDataClient::new(config.api_key.clone(), config.fetch_timeout)?
        .with_base_url(config.base_url.clone());
    let cache = ExpiringCache::new(config.ttl, config.refresh.interval);
    let state = AppState::new(cache.clone(), Arc::new(client));

    let refresh = RefreshHandle::spawn(cache, config.refresh.clone());

    let listener = TcpListener::bind(&config.bind_addr).await?;
    server::serve(listener, state, shutdown_signal()).await?;

    refresh.shutdown().await;
    info!("server stopped");

    Ok(())
}
