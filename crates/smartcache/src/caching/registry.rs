use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::AtomicIsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::instance::Intervals;
use super::{CacheInstance, CacheLoader};
use crate::config::CacheConfig;

/// Maps cache names to [`CacheInstance`]s.
///
/// An instance is created the first time its name is requested and then lives as long as the
/// registry does. If configured, all instances of one registry share a limit on concurrently
/// running background refreshes.
///
/// The registry is a plain value. To share one across a whole process, put it into an
/// [`Arc`] or a `static` [`OnceLock`](std::sync::OnceLock).
pub struct CacheRegistry<V> {
    instances: Mutex<BTreeMap<String, CacheInstance<V>>>,
    /// Shared by all instances, see [`CacheConfig::max_lazy_refreshes`].
    refresh_limit: Option<Arc<AtomicIsize>>,
    config: CacheConfig,
}

impl<V> fmt::Debug for CacheRegistry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self
            .instances
            .try_lock()
            .map(|instances| instances.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("CacheRegistry")
            .field("instances", &names)
            .field("refresh_limit", &self.refresh_limit)
            .finish()
    }
}

impl<V: Send + Sync + 'static> Default for CacheRegistry<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Send + Sync + 'static> CacheRegistry<V> {
    /// Creates a registry without a limit on background refreshes.
    pub fn new() -> Self {
        Self::from_config(&CacheConfig::default())
    }

    /// Creates a registry that allows at most `max_lazy_refreshes` concurrent background refreshes.
    pub fn with_refresh_limit(max_lazy_refreshes: isize) -> Self {
        Self::from_config(&CacheConfig {
            max_lazy_refreshes: Some(max_lazy_refreshes),
            ..Default::default()
        })
    }

    /// Creates a registry using the refresh limit and intervals of the given configuration.
    pub fn from_config(config: &CacheConfig) -> Self {
        // The minimum value here is clamped to 1, as it would otherwise completely disable
        // background refreshes and keys would never get fresh again.
        let refresh_limit = config
            .max_lazy_refreshes
            .map(|max_lazy_refreshes| Arc::new(AtomicIsize::new(max_lazy_refreshes.max(1))));
        Self {
            instances: Mutex::new(BTreeMap::new()),
            refresh_limit,
            config: config.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, CacheInstance<V>>> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the instance called `name`, creating it if needed.
    ///
    /// The `loader` is only used when the instance is created, an existing instance keeps its
    /// original loader and its entries. The intervals however are always updated to the given
    /// values.
    pub fn get_or_create(
        &self,
        name: &str,
        loader: impl CacheLoader<V>,
        refresh_interval: Duration,
        clear_interval: Duration,
    ) -> CacheInstance<V> {
        let mut instances = self.lock();

        if let Some(instance) = instances.get(name) {
            instance.set_intervals(refresh_interval, clear_interval);
            return instance.clone();
        }

        tracing::debug!(
            cache = name,
            refresh_interval = ?refresh_interval,
            clear_interval = ?clear_interval,
            "Creating cache instance"
        );
        let instance = CacheInstance::with_refresh_limit(
            Arc::from(name),
            Arc::new(loader),
            Intervals {
                refresh: refresh_interval,
                clear: clear_interval,
            },
            self.refresh_limit.clone(),
        );
        instances.insert(name.to_owned(), instance.clone());
        instance
    }

    /// Like [`get_or_create`](Self::get_or_create), with the intervals configured for `name`.
    pub fn get_or_create_configured(
        &self,
        name: &str,
        loader: impl CacheLoader<V>,
    ) -> CacheInstance<V> {
        let intervals = self.config.intervals_for(name);
        self.get_or_create(
            name,
            loader,
            intervals.refresh_interval,
            intervals.clear_interval,
        )
    }

    /// Returns the instance called `name`, if it was created before.
    pub fn get(&self, name: &str) -> Option<CacheInstance<V>> {
        self.lock().get(name).cloned()
    }

    /// The names of all instances, in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
