use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use tokio::time::Instant;

use super::CacheError;

/// The lifecycle state of a cached key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
    /// The very first load of this key is in flight, there is no value yet.
    ///
    /// Never handed out to callers of [`CacheInstance::get`](super::CacheInstance::get).
    FirstLoading,
    /// A background refresh is in flight, the attached value is stale.
    Loading,
    /// The value is loaded and no refresh is running.
    Loaded,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FirstLoading => "first_loading",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
        }
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A read-only snapshot of a cached key.
///
/// Snapshots are taken under the instance lock and never change afterwards. A later refresh
/// of the same key is only visible to subsequent lookups.
#[derive(Debug)]
pub struct CacheEntry<V> {
    /// The key this entry was loaded for.
    pub key: Arc<str>,
    /// The last successfully loaded value.
    pub value: Arc<V>,
    /// When `value` was loaded.
    pub loaded_at: Instant,
    /// The state of the key at the time the snapshot was taken.
    pub state: EntryState,
    /// The error of the most recent background refresh, if it failed.
    pub refresh_error: Option<CacheError>,
}

// A derived `Clone` would require `V: Clone`.
impl<V> Clone for CacheEntry<V> {
    fn clone(&self) -> Self {
        Self {
            key: Arc::clone(&self.key),
            value: Arc::clone(&self.value),
            loaded_at: self.loaded_at,
            state: self.state,
            refresh_error: self.refresh_error.clone(),
        }
    }
}

impl<V> CacheEntry<V> {
    /// How long ago the value was loaded.
    pub fn age(&self) -> Duration {
        self.loaded_at.elapsed()
    }

    /// Whether a refresh of this key was in flight when the snapshot was taken.
    pub fn is_refreshing(&self) -> bool {
        self.state == EntryState::Loading
    }
}

/// Resolves once the cold load of a key has been committed or has failed.
pub(super) type FirstLoad<V> = Shared<BoxFuture<'static, Result<CacheEntry<V>, CacheError>>>;

/// What the instance keeps per key.
pub(super) enum Slot<V> {
    /// The cold load is running, waiters subscribe to `done`.
    FirstLoading {
        generation: u64,
        done: FirstLoad<V>,
    },
    /// The key holds a value.
    Ready {
        generation: u64,
        entry: CacheEntry<V>,
    },
}

impl<V> Slot<V> {
    pub fn generation(&self) -> u64 {
        match self {
            Slot::FirstLoading { generation, .. } | Slot::Ready { generation, .. } => *generation,
        }
    }

    /// When the value of this slot was loaded, `None` while the cold load is running.
    ///
    /// The eviction sweep measures the age of a key from here, so a pending cold load is never
    /// evicted.
    pub fn loaded_at(&self) -> Option<Instant> {
        match self {
            Slot::FirstLoading { .. } => None,
            Slot::Ready { entry, .. } => Some(entry.loaded_at),
        }
    }

    pub fn state(&self) -> EntryState {
        match self {
            Slot::FirstLoading { .. } => EntryState::FirstLoading,
            Slot::Ready { entry, .. } => entry.state,
        }
    }
}
