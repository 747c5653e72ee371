use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use sentry::{Hub, SentryFutureExt};
use tokio::time::Instant;

use super::entry::{FirstLoad, Slot};
use super::{CacheEntry, CacheError, CacheLoader, CacheResult, EntryState};
use crate::utils::defer::defer;

/// The refresh and eviction intervals of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intervals {
    /// Age past which a loaded value is stale and gets refreshed in the background.
    pub refresh: Duration,
    /// Additional age past `refresh` after which a key is evicted.
    pub clear: Duration,
}

impl Intervals {
    /// The age at which the eviction sweep removes a key.
    fn max_age(&self) -> Duration {
        self.refresh.saturating_add(self.clear)
    }
}

/// Everything guarded by the instance lock.
struct State<V> {
    entries: HashMap<Arc<str>, Slot<V>>,
    intervals: Intervals,
    next_generation: u64,
}

impl<V> State<V> {
    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Removes every key that was loaded longer than `refresh + clear` ago.
    ///
    /// Keys whose cold load is still running are kept, they have not been loaded yet.
    fn sweep(&mut self, name: &str, now: Instant) -> usize {
        let max_age = self.intervals.max_age();
        let before = self.entries.len();

        self.entries.retain(|key, slot| {
            let expired = slot
                .loaded_at()
                .and_then(|loaded_at| loaded_at.checked_add(max_age))
                .is_some_and(|deadline| deadline < now);
            if expired {
                tracing::trace!(cache = name, key = &**key, state = %slot.state(), "Evicting entry");
            }
            !expired
        });

        let evicted = before - self.entries.len();
        if evicted > 0 {
            metric!(counter("caches.evicted") += evicted as i64, "cache" => name);
            metric!(gauge("caches.entries") = self.entries.len() as u64, "cache" => name);
        }
        evicted
    }
}

/// The state shared between an instance and the load tasks it spawns.
struct Core<V> {
    name: Arc<str>,
    loader: Arc<dyn CacheLoader<V>>,
    state: Mutex<State<V>>,
    /// Counts down towards zero for each running background refresh, `None` if unbounded.
    refresh_limit: Option<Arc<AtomicIsize>>,
}

impl<V: Send + Sync + 'static> Core<V> {
    fn lock(&self) -> MutexGuard<'_, State<V>> {
        // A panicking loader never holds the lock, the map is consistent even if poisoned.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores a freshly loaded value for `key`.
    ///
    /// The value replaces the slot if it still belongs to the load that produced it, or is
    /// re-inserted if the key was evicted in the meantime. A slot from a newer cold load wins.
    fn commit(&self, key: &Arc<str>, generation: u64, value: V) -> CacheEntry<V> {
        let entry = CacheEntry {
            key: Arc::clone(key),
            value: Arc::new(value),
            loaded_at: Instant::now(),
            state: EntryState::Loaded,
            refresh_error: None,
        };

        let mut state = self.lock();
        let replaced = state
            .entries
            .get(key)
            .is_some_and(|slot| slot.generation() != generation);
        if replaced {
            tracing::trace!(
                cache = &*self.name,
                key = &**key,
                "Discarding load result for replaced entry"
            );
        } else {
            if !state.entries.contains_key(key) {
                tracing::trace!(cache = &*self.name, key = &**key, "Re-inserting evicted entry");
            }
            let slot = Slot::Ready {
                generation,
                entry: entry.clone(),
            };
            state.entries.insert(Arc::clone(key), slot);
            metric!(gauge("caches.entries") = state.entries.len() as u64, "cache" => &*self.name);
        }
        entry
    }

    /// Drops the cold load slot for `key` unless it was committed.
    fn abandon_first_load(&self, key: &str, generation: u64) {
        let mut state = self.lock();
        let is_pending = matches!(
            state.entries.get(key),
            Some(Slot::FirstLoading { generation: g, .. }) if *g == generation
        );
        if is_pending {
            state.entries.remove(key);
        }
    }

    /// Puts a key back into `Loaded` after its refresh did not produce a value.
    ///
    /// The old value and its load time are kept, so the key stays stale and the next lookup
    /// starts another refresh.
    fn revert_refresh(&self, key: &str, generation: u64, error: CacheError) {
        let mut state = self.lock();
        if let Some(Slot::Ready { generation: g, entry }) = state.entries.get_mut(key) {
            if *g == generation && entry.state == EntryState::Loading {
                entry.state = EntryState::Loaded;
                entry.refresh_error = Some(error);
            }
        }
    }

    /// Runs the cold load of `key`.
    async fn first_load(self: Arc<Self>, key: Arc<str>, generation: u64) -> CacheResult<CacheEntry<V>> {
        let name = &*self.name;
        // Releases the slot on failure and on panic, a committed slot is left alone.
        let _cleanup = {
            let core = Arc::clone(&self);
            let key = Arc::clone(&key);
            defer(move || core.abandon_first_load(&key, generation))
        };

        tracing::trace!(cache = name, key = &*key, "Loading cold entry");
        metric!(counter("caches.computation") += 1, "cache" => name);

        let started = Instant::now();
        let result = self.loader.load(&key).await;
        metric!(timer("caches.computation.duration") = started.elapsed(), "cache" => name);

        match result {
            Ok(value) => Ok(self.commit(&key, generation, value)),
            Err(err) => {
                let dynerr: &dyn std::error::Error = &*err; // tracing expects a `&dyn Error`
                tracing::error!(error = dynerr, cache = name, key = &*key, "Failed to load cache entry");
                let error = CacheError::from_load_error(&*err);
                metric!(
                    counter("caches.computation.failed") += 1,
                    "cache" => name,
                    "error" => error.metrics_tag(),
                );
                Err(error)
            }
        }
    }

    /// Runs a background refresh of `key`.
    async fn refresh(self: Arc<Self>, key: Arc<str>, generation: u64) {
        let name = &*self.name;
        let started = Instant::now();
        let result = self.loader.load(&key).await;
        metric!(timer("caches.refresh.duration") = started.elapsed(), "cache" => name);

        match result {
            Ok(value) => {
                tracing::trace!(cache = name, key = &*key, "Committing refreshed entry");
                self.commit(&key, generation, value);
            }
            Err(err) => {
                let dynerr: &dyn std::error::Error = &*err;
                tracing::warn!(error = dynerr, cache = name, key = &*key, "Failed to refresh cache entry");
                let error = CacheError::from_load_error(&*err);
                metric!(
                    counter("caches.refresh.failed") += 1,
                    "cache" => name,
                    "error" => error.metrics_tag(),
                );
                self.revert_refresh(&key, generation, error);
            }
        }
    }
}

/// What a lookup resolved to while holding the lock.
enum Lookup<V> {
    /// A snapshot that can be returned right away.
    Ready(CacheEntry<V>),
    /// A stale snapshot whose refresh still has to be spawned.
    Refresh { entry: CacheEntry<V>, generation: u64 },
    /// A cold load to wait for; `started` is set when this lookup started it.
    Wait { done: FirstLoad<V>, started: bool },
}

/// A named cache that loads values lazily and refreshes stale values in the background.
///
/// Values are served "stale-while-revalidate": a key older than the refresh interval is
/// returned as is, while a single background refresh is started for it. Keys that have not
/// been loaded for longer than the refresh interval plus the clear interval are evicted.
///
/// Concurrent lookups of the same cold key are coalesced into a single load. Loads run
/// outside of the instance lock, so a slow load never blocks lookups of other keys.
///
/// The instance is a cheap handle, clones share the same entries.
pub struct CacheInstance<V> {
    core: Arc<Core<V>>,
}

impl<V> Clone for CacheInstance<V> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<V: Send + Sync + 'static> fmt::Debug for CacheInstance<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.core.lock();
        f.debug_struct("CacheInstance")
            .field("name", &self.core.name)
            .field("intervals", &state.intervals)
            .field("entries", &state.entries.len())
            .field(
                "refresh_slots",
                &self
                    .core
                    .refresh_limit
                    .as_ref()
                    .map(|limit| limit.load(Ordering::Relaxed)),
            )
            .finish()
    }
}

impl<V: Send + Sync + 'static> CacheInstance<V> {
    /// Creates a standalone instance.
    ///
    /// Every stale lookup of a standalone instance starts a background refresh, there is no
    /// limit on concurrently running refreshes.
    ///
    /// Instances that should be shared by name are created through
    /// [`CacheRegistry::get_or_create`](super::CacheRegistry::get_or_create) instead.
    pub fn new(
        name: impl Into<Arc<str>>,
        loader: impl CacheLoader<V>,
        refresh_interval: Duration,
        clear_interval: Duration,
    ) -> Self {
        Self::with_refresh_limit(
            name.into(),
            Arc::new(loader),
            Intervals {
                refresh: refresh_interval,
                clear: clear_interval,
            },
            None,
        )
    }

    pub(crate) fn with_refresh_limit(
        name: Arc<str>,
        loader: Arc<dyn CacheLoader<V>>,
        intervals: Intervals,
        refresh_limit: Option<Arc<AtomicIsize>>,
    ) -> Self {
        let state = State {
            entries: HashMap::new(),
            intervals,
            next_generation: 0,
        };
        Self {
            core: Arc::new(Core {
                name,
                loader,
                state: Mutex::new(state),
                refresh_limit,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Returns `true` if both handles refer to the same instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    pub fn intervals(&self) -> Intervals {
        self.core.lock().intervals
    }

    pub fn refresh_interval(&self) -> Duration {
        self.intervals().refresh
    }

    pub fn clear_interval(&self) -> Duration {
        self.intervals().clear
    }

    /// Replaces the intervals; they apply to every subsequent freshness and eviction check.
    pub fn set_intervals(&self, refresh_interval: Duration, clear_interval: Duration) {
        let mut state = self.core.lock();
        let intervals = Intervals {
            refresh: refresh_interval,
            clear: clear_interval,
        };
        if state.intervals != intervals {
            tracing::debug!(cache = self.name(), ?intervals, "Updating cache intervals");
            state.intervals = intervals;
        }
    }

    /// The number of keys currently held, including keys whose first load is in flight.
    pub fn len(&self) -> usize {
        self.core.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs the eviction sweep and returns the number of evicted keys.
    pub fn sweep(&self) -> usize {
        self.core.lock().sweep(self.name(), Instant::now())
    }

    /// Returns the current snapshot of `key` without loading, refreshing or sweeping.
    pub fn peek(&self, key: &str) -> Option<CacheEntry<V>> {
        match self.core.lock().entries.get(key)? {
            Slot::Ready { entry, .. } => Some(entry.clone()),
            Slot::FirstLoading { .. } => None,
        }
    }

    /// Returns the best currently available entry for `key`.
    ///
    /// - A cold key is loaded, and the call waits for the load. Concurrent callers for the
    ///   same key wait for the very same load.
    /// - A fresh key is returned right away.
    /// - A stale key is returned right away as well, and a background refresh is started
    ///   unless one is already running for it.
    ///
    /// This must be called from within a Tokio runtime, as loads are spawned onto it.
    ///
    /// # Errors
    ///
    /// Fails if the cold load of `key` fails. The key is then forgotten and the next call
    /// starts a new load. Failing background refreshes are reported via
    /// [`CacheEntry::refresh_error`] instead.
    pub async fn get(&self, key: &str) -> CacheResult<CacheEntry<V>> {
        metric!(counter("caches.access") += 1, "cache" => self.name());

        loop {
            match self.lookup(key) {
                Lookup::Ready(entry) => return Ok(entry),
                Lookup::Refresh { entry, generation } => {
                    self.spawn_refresh(Arc::clone(&entry.key), generation);
                    return Ok(entry);
                }
                Lookup::Wait { done, started } => {
                    let entry = done.await?;
                    if started {
                        return Ok(entry);
                    }
                    // Another caller's load finished, look at the key again like any other
                    // lookup would.
                }
            }
        }
    }

    fn lookup(&self, key: &str) -> Lookup<V> {
        let name = self.name();
        let now = Instant::now();

        let mut guard = self.core.lock();
        let state = &mut *guard;
        state.sweep(name, now);
        let refresh_interval = state.intervals.refresh;

        if !state.entries.contains_key(key) {
            let done = self.start_first_load(state, key);
            return Lookup::Wait {
                done,
                started: true,
            };
        }

        let (generation, entry) = match state.entries.get_mut(key) {
            Some(Slot::Ready { generation, entry }) => (generation, entry),
            Some(Slot::FirstLoading { done, .. }) => {
                return Lookup::Wait {
                    done: done.clone(),
                    started: false,
                };
            }
            None => unreachable!("checked above"),
        };

        match entry.state {
            EntryState::Loaded => {
                let is_fresh = entry
                    .loaded_at
                    .checked_add(refresh_interval)
                    .is_none_or(|stale_at| stale_at >= now);
                if is_fresh {
                    metric!(counter("caches.memory.hit") += 1, "cache" => name);
                    return Lookup::Ready(entry.clone());
                }
            }
            EntryState::Loading => {
                metric!(counter("caches.memory.stale") += 1, "cache" => name);
                return Lookup::Ready(entry.clone());
            }
            EntryState::FirstLoading => unreachable!("ready slots never hold a first load"),
        }

        metric!(counter("caches.memory.stale") += 1, "cache" => name);
        if !self.try_acquire_refresh() {
            return Lookup::Ready(entry.clone());
        }
        // Each refresh owns the slot under a new generation, so leftovers of an earlier
        // refresh can never touch it.
        state.next_generation += 1;
        *generation = state.next_generation;
        entry.state = EntryState::Loading;
        Lookup::Refresh {
            entry: entry.clone(),
            generation: *generation,
        }
    }

    /// Inserts a `FirstLoading` slot for `key` and spawns its load.
    fn start_first_load(&self, state: &mut State<V>, key: &str) -> FirstLoad<V> {
        let key: Arc<str> = Arc::from(key);
        let generation = state.next_generation();

        let task = Arc::clone(&self.core).first_load(Arc::clone(&key), generation);
        let handle = tokio::spawn(task.bind_hub(Hub::new_from_top(Hub::current())));
        let done = async move { handle.await? }.boxed().shared();

        state.entries.insert(
            key,
            Slot::FirstLoading {
                generation,
                done: done.clone(),
            },
        );
        metric!(gauge("caches.entries") = state.entries.len() as u64, "cache" => self.name());

        done
    }

    /// Takes one of the shared refresh slots, if the instance has a refresh limit.
    ///
    /// Returns `false` if all of them are in use, in which case the key keeps being served stale.
    fn try_acquire_refresh(&self) -> bool {
        let Some(refresh_limit) = &self.core.refresh_limit else {
            return true;
        };
        // We count down towards zero, and if we reach or surpass it, we will stop here.
        if refresh_limit.fetch_sub(1, Ordering::Relaxed) <= 0 {
            refresh_limit.fetch_add(1, Ordering::Relaxed);

            tracing::debug!(cache = self.name(), "Refresh limit reached, serving stale entry");
            metric!(counter("caches.lazy_limit_hit") += 1, "cache" => self.name());
            return false;
        }
        true
    }

    /// Spawns the background refresh of `key`, after a slot was taken via
    /// [`try_acquire_refresh`](Self::try_acquire_refresh).
    fn spawn_refresh(&self, key: Arc<str>, generation: u64) {
        let done_token = {
            let core = Arc::clone(&self.core);
            let key = Arc::clone(&key);
            defer(move || {
                if let Some(refresh_limit) = &core.refresh_limit {
                    refresh_limit.fetch_add(1, Ordering::Relaxed);
                }
                // only has an effect if the refresh task panicked
                core.revert_refresh(&key, generation, CacheError::InternalError);
            })
        };

        tracing::trace!(cache = self.name(), key = &*key, "Spawning background refresh");
        metric!(counter("caches.refresh") += 1, "cache" => self.name());

        let core = Arc::clone(&self.core);
        let task = async move {
            let _done_token = done_token; // move into the future
            core.refresh(key, generation).await;
        };
        tokio::spawn(task.bind_hub(Hub::new_from_top(Hub::current())));
    }
}
