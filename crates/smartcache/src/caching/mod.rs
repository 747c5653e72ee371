//! # Stale-while-revalidate caching
//!
//! This module contains the cache engine: named [`CacheInstance`]s that lazily load values
//! through a [`CacheLoader`], serve them for a bounded amount of time, refresh them in the
//! background once they are stale, and evict keys nobody asked for in a while. The
//! [`CacheRegistry`] hands out instances by name.
//!
//! ## Entry Lifecycle
//!
//! Each key of an instance goes through the following [`EntryState`]s:
//!
//! - `FirstLoading`: The first lookup of a key inserts it and spawns the loader. The lookup
//!   waits for the load to finish. All other lookups of the same key that arrive in the
//!   meantime wait for the very same load (request coalescing), they never start one of
//!   their own.
//! - `Loaded`: The load has been committed. Lookups are served right away.
//! - `Loading`: A lookup found the value older than the refresh interval. It gets the stale
//!   value, and a background refresh is spawned. Further lookups get the stale value as well
//!   and do not start another refresh. When the refresh finishes, the key is `Loaded` again.
//!
//! Callers only ever see `Loaded` or `Loading` entries.
//!
//! ## Eviction
//!
//! Every lookup starts by sweeping the instance: every key whose value was loaded longer than
//! `refresh_interval + clear_interval` ago is removed, no matter its state. A background
//! refresh that finishes after its key was evicted re-inserts the key. Eviction is purely
//! time-based, there is no size bound.
//!
//! ## Locking
//!
//! Each instance has a single lock around its entries. It is held while inspecting and
//! updating entries, but never while a loader runs. Loads are spawned as tasks and only take
//! the lock to commit their result, so a slow load of one key does not block lookups of
//! other keys.
//!
//! ## Errors
//!
//! A failing cold load is reported to the caller and to all lookups waiting on it as a
//! [`CacheError`], and the key is forgotten so the next lookup tries again.
//!
//! A failing background refresh puts the key back into `Loaded` with its previous value and
//! load time, and records the failure in [`CacheEntry::refresh_error`]. As the value is still
//! stale, the next lookup starts another refresh.
//!
//! ## Refresh Limit
//!
//! By default, every stale lookup starts a background refresh unless one is already running for
//! its key. A registry can optionally limit the number of concurrently running refreshes across
//! all of its instances, see [`CacheConfig::max_lazy_refreshes`](crate::config::CacheConfig).
//! When that limit is reached, stale values are served without starting a refresh, and a later
//! lookup tries again.
//!
//! ### Metrics
//!
//! Each of the following metrics is tagged with a `cache` field that corresponds to the
//! instance name:
//!
//! - `caches.access`: All lookups.
//! - `caches.memory.hit`: Lookups served with a fresh value.
//! - `caches.memory.stale`: Lookups served with a stale value.
//! - `caches.computation`: Cold loads.
//! - `caches.refresh`: Background refreshes.
//! - `caches.computation.failed` / `caches.refresh.failed`: Failing loads, tagged by `error`.
//! - `caches.lazy_limit_hit`: Refreshes skipped due to the refresh limit.
//! - `caches.evicted`: Keys removed by the eviction sweep.
//! - `caches.entries`: A gauge of the number of keys.

mod cache_error;
mod entry;
mod instance;
mod loader;
mod registry;
#[cfg(test)]
mod tests;

pub use cache_error::{CacheError, CacheResult};
pub use entry::{CacheEntry, EntryState};
pub use instance::{CacheInstance, Intervals};
pub use loader::{CacheLoader, FnLoader, LoadError, LoadFuture, loader_fn};
pub use registry::CacheRegistry;
