//! Command-line interface parsing for the market cache server
//!
//! This module handles parsing of CLI arguments (with environment variable
//! fallbacks) using clap, and validates them into a [`ServerConfig`].

use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::data::market::ALPHA_VANTAGE_BASE_URL;
use crate::refresh::RefreshConfig;

/// Error types for CLI argument validation
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CliError {
    /// A duration option was set to zero
    #[error("Invalid value for --{0}: must be greater than zero")]
    ZeroDuration(&'static str),

    /// The API key was empty
    #[error("Invalid value for --api-key: must not be empty")]
    EmptyApiKey,
}

/// Market Cache - serve market time series through a self-refreshing cache
#[derive(Parser, Debug)]
#[command(name = "marketcache")]
#[command(about = "HTTP service for market time series with a self-refreshing TTL cache")]
#[command(version)]
pub struct Cli {
    /// Address to bind the HTTP server to
    #[arg(long, env = "MARKETCACHE_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port to bind the HTTP server to
    #[arg(long, env = "MARKETCACHE_PORT", default_value_t = 3000)]
    pub port: u16,

    /// Alpha Vantage API key
    #[arg(long, env = "ALPHA_VANTAGE_API_KEY", default_value = "demo", hide_env_values = true)]
    pub api_key: String,

    /// Upstream API endpoint
    #[arg(long, env = "ALPHA_VANTAGE_BASE_URL", default_value = ALPHA_VANTAGE_BASE_URL)]
    pub base_url: String,

    /// How long a cached series stays servable, in seconds
    #[arg(long, value_name = "SECS", default_value_t = 600)]
    pub ttl_secs: u64,

    /// Time between background refresh passes, in seconds
    #[arg(long, value_name = "SECS", default_value_t = 60)]
    pub refresh_interval_secs: u64,

    /// Upper bound on a single upstream request, in seconds
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    pub fetch_timeout_secs: u64,

    /// Disable the background refresh loop
    #[arg(long)]
    pub no_refresh: bool,
}

/// Validated server configuration derived from CLI arguments
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// `host:port` to listen on
    pub bind_addr: String,
    /// Alpha Vantage API key
    pub api_key: String,
    /// Upstream API endpoint
    pub base_url: String,
    /// Cache entry time-to-live
    pub ttl: Duration,
    /// Background refresh schedule
    pub refresh: RefreshConfig,
    /// Upstream request timeout
    pub fetch_timeout: Duration,
}

impl ServerConfig {
    /// Creates a ServerConfig from parsed CLI arguments.
    ///
    /// # Returns
    /// * `Ok(ServerConfig)` with durations converted
    /// * `Err(CliError)` if a duration is zero or the API key is blank
    pub fn from_cli(cli: &Cli) -> Result<Self, CliError> {
        let ttl = positive_secs("ttl-secs", cli.ttl_secs)?;
        let refresh_interval = positive_secs("refresh-interval-secs", cli.refresh_interval_secs)?;
        let fetch_timeout = positive_secs("fetch-timeout-secs", cli.fetch_timeout_secs)?;

        if cli.api_key.trim().is_empty() {
            return Err(CliError::EmptyApiKey);
        }

        Ok(ServerConfig {
            bind_addr: format!("{}:{}", cli.host, cli.port),
            api_key: cli.api_key.clone(),
            base_url: cli.base_url.clone(),
            ttl,
            refresh: RefreshConfig {
                interval: refresh_interval,
                enabled: !cli.no_refresh,
            },
            fetch_timeout,
        })
    }
}

fn positive_secs(flag: &'static str, secs: u64) -> Result<Duration, CliError> {
    if secs == 0 {
        Err(CliError::ZeroDuration(flag))
    } else {
        Ok(Duration::from_secs(secs))
    }
}
