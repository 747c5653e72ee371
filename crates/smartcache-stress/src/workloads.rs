use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use rand::Rng;
use serde::{Deserialize, Serialize};

use smartcache::caching::{CacheLoader, LoadFuture};
use smartcache::{CacheEntry, CacheInstance, CacheRegistry, EntryState};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    /// Name of the cache instance, workloads with the same name share one instance.
    pub cache: String,
    pub concurrency: usize,
    /// Size of the key space lookups are spread over.
    pub keys: usize,
    /// How long each invocation of the loader takes.
    #[serde(default, with = "humantime_serde")]
    pub latency: Duration,
    /// Probability of a loader invocation to fail, between `0` and `1`.
    #[serde(default)]
    pub failure_rate: f64,
}

/// A loader that simulates a slow and flaky backend.
#[derive(Debug)]
pub struct SyntheticLoader {
    latency: Duration,
    failure_rate: f64,
    loads: Arc<AtomicUsize>,
}

impl SyntheticLoader {
    pub fn new(latency: Duration, failure_rate: f64, loads: Arc<AtomicUsize>) -> Self {
        Self {
            latency,
            failure_rate: failure_rate.clamp(0.0, 1.0),
            loads,
        }
    }
}

impl CacheLoader<String> for SyntheticLoader {
    fn load<'a>(&'a self, key: &'a str) -> LoadFuture<'a, String> {
        async move {
            self.loads.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(self.latency).await;

            let fail = rand::rng().random_bool(self.failure_rate);
            if fail {
                return Err(io::Error::other(format!("backend failed to produce {key}")).into());
            }
            Ok(format!("value of {key}"))
        }
        .boxed()
    }
}

/// Counters of a single workload, shared by all of its lookups.
#[derive(Debug, Default)]
pub struct WorkloadStats {
    pub loads: Arc<AtomicUsize>,
    pub failures: AtomicUsize,
    pub stale: AtomicUsize,
}

/// A workload that is ready to run against its cache instance.
#[derive(Debug)]
pub struct PreparedWorkload {
    pub concurrency: usize,
    keys: usize,
    cache: CacheInstance<String>,
    pub stats: WorkloadStats,
}

pub fn prepare_workload(registry: &CacheRegistry<String>, workload: Workload) -> PreparedWorkload {
    let stats = WorkloadStats::default();
    let loader = SyntheticLoader::new(
        workload.latency,
        workload.failure_rate,
        Arc::clone(&stats.loads),
    );
    let cache = registry.get_or_create_configured(&workload.cache, loader);

    PreparedWorkload {
        concurrency: workload.concurrency.max(1),
        keys: workload.keys.max(1),
        cache,
        stats,
    }
}

/// Whether `entry` was served with a value older than the refresh interval.
fn is_stale(entry: &CacheEntry<String>, refresh_interval: Duration) -> bool {
    entry.state == EntryState::Loading || entry.age() > refresh_interval
}

/// Looks up a random key of the workload's key space.
pub async fn process_workload(workload: &PreparedWorkload) {
    let key = format!("key-{}", rand::rng().random_range(0..workload.keys));

    match workload.cache.get(&key).await {
        Ok(entry) => {
            // with a refresh limit, stale values may be served without a refresh
            if is_stale(&entry, workload.cache.refresh_interval()) {
                workload.stats.stale.fetch_add(1, Ordering::Relaxed);
            }
        }
        Err(_) => {
            workload.stats.failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}
