//! Cache module for holding upstream responses in memory
//!
//! This module provides an expiring cache that serves entries for a fixed TTL,
//! evicts expired entries lazily on read, coalesces concurrent loads of the same
//! key, and can refresh still-valid entries in place. Nothing is persisted.

mod entry;
mod manager;

pub use entry::CacheEntry;
pub use manager::{loader_fn, ExpiringCache, LoadResult, Loader, RefreshSummary};
