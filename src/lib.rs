//! Market Cache Library
//!
//! This module exposes the cache, data, refresh and server modules for use by the
//! binary and in integration tests.

pub mod cache;
pub mod cli;
pub mod data;
pub mod refresh;
pub mod server;
