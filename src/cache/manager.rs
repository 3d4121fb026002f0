//! In-memory expiring cache with coalesced loads and background refresh
//!
//! Provides an `ExpiringCache` that keeps fetched results for a fixed TTL, collapses
//! concurrent misses for the same key into one upstream call, and can re-run the
//! loader for every still-valid key to keep entries warm.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::time::Instant;

use super::CacheEntry;

/// Re-runnable fetch bound to the parameters that produced an entry
pub type Loader<T, E> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

/// Outcome of a load, shared by every caller waiting on it
pub type LoadResult<T, E> = Result<Arc<T>, Arc<E>>;

type InFlight<T, E> = Shared<BoxFuture<'static, LoadResult<T, E>>>;

/// Wraps an async closure as a [`Loader`]
pub fn loader_fn<T, E, F, Fut>(f: F) -> Loader<T, E>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Counters describing one background refresh pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    /// Entries overwritten with fresh data
    pub refreshed: usize,
    /// Entries whose refresh fetch failed (previous data kept)
    pub failed: usize,
    /// Entries already expired when inspected
    pub skipped_expired: usize,
    /// Entries that already had a load in flight
    pub skipped_in_flight: usize,
    /// Entries stored with `set` and no loader to re-run
    pub skipped_no_loader: usize,
    /// The pass did not run because another pass was still going
    pub skipped_overlap: bool,
}

struct Slot<T, E> {
    entry: CacheEntry<T>,
    loader: Option<Loader<T, E>>,
}

struct State<T, E> {
    slots: HashMap<String, Slot<T, E>>,
    in_flight: HashMap<String, InFlight<T, E>>,
}

impl<T, E> State<T, E> {
    /// Returns the entry if valid; removes it if expired
    fn valid_entry(&mut self, key: &str, ttl: Duration, now: Instant) -> Option<CacheEntry<T>> {
        let slot = self.slots.get(key)?;
        if slot.entry.is_valid(ttl, now) {
            return Some(slot.entry.clone());
        }
        self.slots.remove(key);
        tracing::debug!(key, "evicted expired entry");
        None
    }

    fn store(&mut self, key: String, data: Arc<T>, loader: Option<Loader<T, E>>) {
        let loader = loader.or_else(|| self.slots.get(&key).and_then(|s| s.loader.clone()));
        self.slots.insert(
            key,
            Slot {
                entry: CacheEntry::new(data),
                loader,
            },
        );
    }
}

fn lock<T, E>(state: &Mutex<State<T, E>>) -> MutexGuard<'_, State<T, E>> {
    // Every critical section leaves the maps consistent, so a poisoned lock is still usable.
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears a key's in-flight slot if its load task unwinds before storing a result
struct InFlightSlot<T, E> {
    state: Arc<Mutex<State<T, E>>>,
    key: Option<String>,
}

impl<T, E> Drop for InFlightSlot<T, E> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            lock(&self.state).in_flight.remove(&key);
            tracing::warn!(key = %key, "load ended without a result");
        }
    }
}

/// Why a key was left alone by a refresh pass
enum Skip {
    Gone,
    Expired,
    NoLoader,
    InFlight,
}

/// Resets the pass flag when a refresh pass ends, even if it is cancelled
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Key-addressed store of fetched results with a fixed time-to-live
///
/// Entries older than `ttl` are never returned and are removed on the next read.
/// Each entry remembers the loader that produced it so a refresh pass can repeat
/// the same fetch. Clones share the same underlying store.
pub struct ExpiringCache<T, E> {
    state: Arc<Mutex<State<T, E>>>,
    refreshing: Arc<AtomicBool>,
    ttl: Duration,
    refresh_interval: Duration,
}

impl<T, E> Clone for ExpiringCache<T, E> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            refreshing: Arc::clone(&self.refreshing),
            ttl: self.ttl,
            refresh_interval: self.refresh_interval,
        }
    }
}

impl<T, E> fmt::Debug for ExpiringCache<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpiringCache")
            .field("ttl", &self.ttl)
            .field("refresh_interval", &self.refresh_interval)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl<T, E> ExpiringCache<T, E> {
    /// Creates an empty cache
    pub fn new(ttl: Duration, refresh_interval: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                slots: HashMap::new(),
                in_flight: HashMap::new(),
            })),
            refreshing: Arc::new(AtomicBool::new(false)),
            ttl,
            refresh_interval,
        }
    }

    /// Maximum age of a servable entry
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Time between background refresh passes
    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Number of stored entries, including expired ones not yet evicted
    pub fn len(&self) -> usize {
        lock(&self.state).slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the payload for `key` if it was stored within the last `ttl`
    ///
    /// An expired entry is removed and `None` is returned. Never calls a loader.
    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.get_entry(key).map(|entry| Arc::clone(entry.data()))
    }

    /// Like [`get`](Self::get) but also returns when the entry was cached
    pub fn get_entry(&self, key: &str) -> Option<CacheEntry<T>> {
        lock(&self.state).valid_entry(key, self.ttl, Instant::now())
    }

    /// Inserts or replaces the entry for `key`, stamped with the current time
    ///
    /// A loader already associated with `key` is kept.
    pub fn set(&self, key: impl Into<String>, data: T) {
        lock(&self.state).store(key.into(), Arc::new(data), None);
    }

    /// Inserts or replaces the entry for `key` and records how to refetch it
    pub fn set_with_loader(&self, key: impl Into<String>, data: T, loader: Loader<T, E>) {
        lock(&self.state).store(key.into(), Arc::new(data), Some(loader));
    }
}

impl<T, E> ExpiringCache<T, E>
where
    T: Send + Sync + 'static,
    E: fmt::Display + Send + Sync + 'static,
{
    /// Returns cached data on a valid hit, otherwise runs `loader` and stores its result
    ///
    /// Concurrent misses for the same key share a single loader call and all receive
    /// its result. A failed load stores nothing, so the next call tries again.
    pub async fn fetch_or_load(&self, key: &str, loader: Loader<T, E>) -> LoadResult<T, E> {
        match self.lookup_or_start(key, loader) {
            Ok(data) => Ok(data),
            Err(load) => load.await,
        }
    }

    /// Returns a valid hit, or the in-flight load to wait on (starting one if needed)
    fn lookup_or_start(&self, key: &str, loader: Loader<T, E>) -> Result<Arc<T>, InFlight<T, E>> {
        let mut state = lock(&self.state);
        if let Some(entry) = state.valid_entry(key, self.ttl, Instant::now()) {
            tracing::debug!(key, "cache hit");
            return Ok(Arc::clone(entry.data()));
        }
        if let Some(load) = state.in_flight.get(key) {
            tracing::debug!(key, "joining in-flight load");
            return Err(load.clone());
        }
        tracing::debug!(key, "cache miss");
        Err(self.start_load(&mut state, key, loader))
    }

    /// Registers a load for `key` in the in-flight table and returns it
    ///
    /// The loader runs on its own task, so it finishes and clears its in-flight slot
    /// even if every waiter is dropped. It stores its result and clears the slot
    /// under one lock, so readers see either the old entry with a pending load or
    /// the new entry.
    fn start_load(&self, state: &mut State<T, E>, key: &str, loader: Loader<T, E>) -> InFlight<T, E> {
        let mut slot = InFlightSlot {
            state: Arc::clone(&self.state),
            key: Some(key.to_string()),
        };
        let call = loader();

        let task = tokio::spawn(async move {
            let result = call.await.map(Arc::new).map_err(Arc::new);
            let mut state = lock(&slot.state);
            if let Some(key) = slot.key.take() {
                state.in_flight.remove(&key);
                if let Ok(data) = &result {
                    state.store(key, Arc::clone(data), Some(loader));
                }
            }
            result
        });

        let load = async move {
            match task.await {
                Ok(result) => result,
                Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                Err(err) => panic!("cache load task was cancelled: {}", err),
            }
        }
        .boxed()
        .shared();

        // The task cannot clear this slot before it is inserted: it needs the lock held here.
        state.in_flight.insert(key.to_string(), load.clone());
        load
    }

    /// Re-runs the loader of every entry that is still valid when inspected
    ///
    /// Keys are refreshed one at a time. Expired entries are left for lazy eviction.
    /// A failed refresh is logged and the previous entry stays in place. If another
    /// pass is still running this returns immediately with `skipped_overlap` set.
    pub async fn refresh_pass(&self) -> RefreshSummary {
        let mut summary = RefreshSummary::default();
        if self.refreshing.swap(true, Ordering::AcqRel) {
            tracing::debug!("refresh pass already running");
            summary.skipped_overlap = true;
            return summary;
        }
        let _guard = PassGuard(&*self.refreshing);

        let keys: Vec<String> = lock(&self.state).slots.keys().cloned().collect();
        for key in keys {
            let load = match self.claim_refresh(&key) {
                Ok(load) => load,
                Err(skip) => {
                    match skip {
                        Skip::Gone => {}
                        Skip::Expired => summary.skipped_expired += 1,
                        Skip::NoLoader => summary.skipped_no_loader += 1,
                        Skip::InFlight => summary.skipped_in_flight += 1,
                    }
                    continue;
                }
            };

            match load.await {
                Ok(_) => {
                    summary.refreshed += 1;
                    tracing::debug!(key = %key, "refreshed entry");
                }
                Err(err) => {
                    summary.failed += 1;
                    tracing::warn!(key = %key, error = %err, "refresh failed, keeping previous entry");
                }
            }
        }

        summary
    }

    /// Starts a refresh load for `key` if its entry is valid, refetchable and idle
    fn claim_refresh(&self, key: &str) -> Result<InFlight<T, E>, Skip> {
        let mut state = lock(&self.state);
        let slot = state.slots.get(key).ok_or(Skip::Gone)?;
        if !slot.entry.is_valid(self.ttl, Instant::now()) {
            return Err(Skip::Expired);
        }
        let loader = slot.loader.clone().ok_or(Skip::NoLoader)?;
        if state.in_flight.contains_key(key) {
            return Err(Skip::InFlight);
        }
        Ok(self.start_load(&mut state, key, loader))
    }
}
