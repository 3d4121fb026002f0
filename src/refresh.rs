//! Background cache refresh system
//!
//! Runs refresh passes over an [`ExpiringCache`] on a fixed interval and reports
//! the outcome of each pass through a tokio channel.

use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::cache::{ExpiringCache, RefreshSummary};

/// Messages sent from the background refresh task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshMessage {
    /// A refresh pass finished
    PassCompleted(RefreshSummary),
}

/// Configuration for the refresh schedule
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Time between refresh passes
    pub interval: Duration,
    /// Whether auto-refresh is enabled
    pub enabled: bool,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            enabled: true,
        }
    }
}

/// Handle for controlling the background refresh task
pub struct RefreshHandle {
    /// Channel for receiving refresh reports; reports are dropped while it is full
    pub receiver: mpsc::Receiver<RefreshMessage>,
    /// Flag to signal shutdown
    shutdown_tx: mpsc::Sender<()>,
}

impl RefreshHandle {
    /// Spawns the refresh task for `cache`
    ///
    /// The first pass runs one `interval` after spawning. Each pass is awaited before
    /// the next tick is taken, and ticks missed during a slow pass are skipped rather
    /// than replayed, so passes never overlap or burst.
    pub fn spawn<T, E>(cache: ExpiringCache<T, E>, config: RefreshConfig) -> Self
    where
        T: Send + Sync + 'static,
        E: fmt::Display + Send + Sync + 'static,
    {
        let (msg_tx, msg_rx) = mpsc::channel(32);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        if config.enabled {
            let refresh_interval = config.interval;
            tracing::info!(interval_secs = refresh_interval.as_secs_f64(), "starting background refresh");

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(refresh_interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                // Skip the first tick (immediate)
                interval.tick().await;

                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            let summary = cache.refresh_pass().await;
                            if summary.failed > 0 {
                                tracing::warn!(failed = summary.failed, refreshed = summary.refreshed, "refresh pass had failures");
                            } else {
                                tracing::info!(refreshed = summary.refreshed, expired = summary.skipped_expired, "refresh pass completed");
                            }
                            // A full channel means nobody is reading; drop the report.
                            let _ = msg_tx.try_send(RefreshMessage::PassCompleted(summary));
                        }
                        _ = shutdown_rx.recv() => {
                            tracing::info!("background refresh stopped");
                            break;
                        }
                    }
                }
            });
        }

        Self {
            receiver: msg_rx,
            shutdown_tx,
        }
    }

    /// Shuts down the background refresh task
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Checks for a pending refresh report without blocking
///
/// # Returns
/// * `Some(RefreshMessage)` if a message was available
/// * `None` if no messages are pending
pub fn try_recv(handle: &mut RefreshHandle) -> Option<RefreshMessage> {
    handle.receiver.try_recv().ok()
}
