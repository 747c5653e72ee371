//! A named, time-based key/value cache with lazy loading and background refresh.
//!
//! See the [`caching`] module for how entries are loaded, refreshed and evicted.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod logging;
pub mod utils;

pub use caching::{
    CacheEntry, CacheError, CacheInstance, CacheLoader, CacheRegistry, CacheResult, EntryState,
    loader_fn,
};
