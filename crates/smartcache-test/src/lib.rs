//! Helpers for testing the cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Loaders count their invocations with a [`HitCounter`], which is shared between the test
//!    and the loader closure by cloning it.
//!
//!  - Loads that should stay in flight until the test says so wait on a [`Gate`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `smartcache` crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("smartcache=trace,smartcache_stress=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Counts how often each key was loaded.
#[derive(Clone, Debug, Default)]
pub struct HitCounter {
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
    total: Arc<AtomicUsize>,
}

impl HitCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a load of `key` and returns how many loads of `key` happened before, including
    /// this one.
    pub fn hit(&self, key: &str) -> usize {
        self.total.fetch_add(1, Ordering::SeqCst);
        let mut hits = self.hits.lock().unwrap();
        let count = hits.entry(key.to_owned()).or_default();
        *count += 1;
        *count
    }

    /// Loads of `key` so far.
    pub fn hits(&self, key: &str) -> usize {
        self.hits.lock().unwrap().get(key).copied().unwrap_or_default()
    }

    /// Loads of all keys so far.
    pub fn accesses(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    /// All keys with their load count, sorted by key.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        self.hits
            .lock()
            .unwrap()
            .iter()
            .map(|(key, count)| (key.clone(), *count))
            .collect()
    }
}

/// Holds loads back until the test opens it.
///
/// Every [`wait`](Self::wait) consumes one permit handed out via [`open`](Self::open).
#[derive(Clone, Debug)]
pub struct Gate {
    permits: Arc<Semaphore>,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(0)),
        }
    }

    /// Lets `n` waiting (or future) loads pass.
    pub fn open(&self, n: usize) {
        self.permits.add_permits(n);
    }

    /// Waits until a permit is available.
    pub async fn wait(&self) {
        self.permits.acquire().await.unwrap().forget();
    }
}
