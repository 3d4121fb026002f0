//! Immutable cache entries

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Snapshot of fetched data plus the moment it was stored
///
/// Entries are never mutated; a refresh or re-fetch replaces the whole entry.
#[derive(Debug)]
pub struct CacheEntry<T> {
    data: Arc<T>,
    stored_at: Instant,
    cached_at: DateTime<Utc>,
}

// Manual impl: cloning only bumps the `Arc`, so `T` need not be `Clone`.
impl<T> Clone for CacheEntry<T> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            stored_at: self.stored_at,
            cached_at: self.cached_at,
        }
    }
}

impl<T> CacheEntry<T> {
    /// Stamps `data` with the current time
    pub fn new(data: Arc<T>) -> Self {
        Self {
            data,
            stored_at: Instant::now(),
            cached_at: Utc::now(),
        }
    }

    /// The cached payload
    pub fn data(&self) -> &Arc<T> {
        &self.data
    }

    /// Wall-clock time the entry was written
    pub fn cached_at(&self) -> DateTime<Utc> {
        self.cached_at
    }

    /// Time elapsed since the entry was written
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.stored_at)
    }

    /// An entry is valid while its age is at most `ttl`
    pub fn is_valid(&self, ttl: Duration, now: Instant) -> bool {
        self.age(now) <= ttl
    }
}
