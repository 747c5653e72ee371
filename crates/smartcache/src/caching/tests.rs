use std::io;
use std::time::Duration;

use futures::future::join_all;
use smartcache_test::{self as test, Gate, HitCounter};
use tokio::time::sleep;

use super::*;
use crate::config::{CacheConfig, InstanceConfig};

const REFRESH: Duration = Duration::from_millis(100);
const CLEAR: Duration = Duration::from_millis(50);

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// Loads `{key}-v{n}`, where `n` counts the loads of `key`, after waiting for `latency`.
fn versioned(counter: &HitCounter, latency: Duration) -> impl CacheLoader<String> + use<> {
    let counter = counter.clone();
    loader_fn(move |key: String| {
        let counter = counter.clone();
        async move {
            let n = counter.hit(&key);
            if !latency.is_zero() {
                sleep(latency).await;
            }
            Ok::<_, io::Error>(format!("{key}-v{n}"))
        }
    })
}

/// Like [`versioned`], but every load after the first one of a key waits for the gate.
fn gated_refresh(counter: &HitCounter, gate: &Gate) -> impl CacheLoader<String> + use<> {
    let counter = counter.clone();
    let gate = gate.clone();
    loader_fn(move |key: String| {
        let counter = counter.clone();
        let gate = gate.clone();
        async move {
            let n = counter.hit(&key);
            if n > 1 {
                gate.wait().await;
            }
            Ok::<_, io::Error>(format!("{key}-v{n}"))
        }
    })
}

/// Follows a single key through its whole lifecycle, with a loader that takes 10ms:
///
/// - t=0: cold load, committed at t=10
/// - t=50: fresh hit
/// - t=150: stale, served right away and refreshed, committed at t=160
/// - t=170: fresh hit of the refreshed value
/// - t=311: evicted (160 + 100 + 50 < 311), loaded again
#[tokio::test(start_paused = true)]
async fn test_lifecycle() {
    test::setup();
    let counter = HitCounter::new();
    let cache = CacheInstance::new("lifecycle", versioned(&counter, ms(10)), REFRESH, CLEAR);

    let entry = cache.get("x").await.unwrap();
    assert_eq!(entry.value.as_str(), "x-v1");
    assert_eq!(entry.state, EntryState::Loaded);
    assert_eq!(counter.hits("x"), 1);

    sleep(ms(40)).await;
    let entry = cache.get("x").await.unwrap();
    assert_eq!(entry.value.as_str(), "x-v1");
    assert_eq!(entry.state, EntryState::Loaded);
    assert_eq!(counter.hits("x"), 1);

    sleep(ms(100)).await;
    let entry = cache.get("x").await.unwrap();
    assert_eq!(entry.value.as_str(), "x-v1");
    assert_eq!(entry.state, EntryState::Loading);

    // the refresh is still running, this must not start another one
    let entry = cache.get("x").await.unwrap();
    assert_eq!(entry.value.as_str(), "x-v1");
    assert!(entry.is_refreshing());

    sleep(ms(20)).await;
    assert_eq!(counter.hits("x"), 2);
    let entry = cache.get("x").await.unwrap();
    assert_eq!(entry.value.as_str(), "x-v2");
    assert_eq!(entry.state, EntryState::Loaded);
    assert_eq!(entry.refresh_error, None);

    sleep(ms(141)).await;
    // eviction only happens during lookups
    assert_eq!(cache.len(), 1);
    let entry = cache.get("x").await.unwrap();
    assert_eq!(entry.value.as_str(), "x-v3");
    assert_eq!(entry.state, EntryState::Loaded);
    assert_eq!(counter.hits("x"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_single_flight() {
    test::setup();
    let counter = HitCounter::new();
    let cache = CacheInstance::new("single_flight", versioned(&counter, ms(50)), REFRESH, CLEAR);

    let results = join_all((0..20).map(|_| cache.get("k"))).await;

    for result in results {
        let entry = result.unwrap();
        assert_eq!(entry.value.as_str(), "k-v1");
        assert_eq!(entry.state, EntryState::Loaded);
    }
    assert_eq!(counter.hits("k"), 1);
    assert_eq!(cache.len(), 1);
}

/// A cold load that takes longer than `refresh + clear` is not evicted while it runs, and
/// lookups arriving late still join it.
#[tokio::test(start_paused = true)]
async fn test_slow_cold_load_is_not_evicted() {
    test::setup();
    let counter = HitCounter::new();
    let cache = CacheInstance::new("slow_cold_load", versioned(&counter, ms(200)), REFRESH, CLEAR);

    let early = tokio::spawn({
        let cache = cache.clone();
        async move { cache.get("k").await }
    });
    sleep(ms(160)).await;

    let late = tokio::spawn({
        let cache = cache.clone();
        async move { cache.get("k").await }
    });
    sleep(ms(1)).await;
    assert_eq!(cache.sweep(), 0);
    assert_eq!(cache.len(), 1);

    let early = early.await.unwrap().unwrap();
    let late = late.await.unwrap().unwrap();
    assert_eq!(early.value.as_str(), "k-v1");
    assert_eq!(late.value.as_str(), "k-v1");
    assert_eq!(counter.hits("k"), 1);

    // the age of the key starts with the commit
    let entry = cache.get("k").await.unwrap();
    assert_eq!(entry.state, EntryState::Loaded);
    assert_eq!(counter.hits("k"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_flight_across_threads() {
    test::setup();
    let counter = HitCounter::new();
    let cache = CacheInstance::new(
        "single_flight_mt",
        versioned(&counter, ms(50)),
        Duration::from_secs(60),
        Duration::from_secs(60),
    );

    let tasks: Vec<_> = (0..50)
        .map(|i| {
            let cache = cache.clone();
            tokio::spawn(async move {
                let key = if i % 2 == 0 { "even" } else { "odd" };
                cache.get(key).await
            })
        })
        .collect();

    for task in join_all(tasks).await {
        let entry = task.unwrap().unwrap();
        assert!(entry.value.ends_with("-v1"));
    }
    assert_eq!(
        counter.all_hits(),
        vec![("even".to_owned(), 1), ("odd".to_owned(), 1)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_single_refresh_while_stale() {
    test::setup();
    let counter = HitCounter::new();
    let gate = Gate::new();
    let cache = CacheInstance::new("single_refresh", gated_refresh(&counter, &gate), REFRESH, CLEAR);

    cache.get("k").await.unwrap();
    sleep(ms(120)).await;

    for _ in 0..5 {
        let entry = cache.get("k").await.unwrap();
        assert_eq!(entry.value.as_str(), "k-v1");
        assert_eq!(entry.state, EntryState::Loading);
        sleep(ms(1)).await;
    }
    assert_eq!(counter.hits("k"), 2);

    gate.open(1);
    sleep(ms(1)).await;

    let entry = cache.get("k").await.unwrap();
    assert_eq!(entry.value.as_str(), "k-v2");
    assert_eq!(entry.state, EntryState::Loaded);
    assert_eq!(counter.hits("k"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_slow_load_does_not_block_other_keys() {
    test::setup();
    let counter = HitCounter::new();
    let gate = Gate::new();
    let loader = {
        let counter = counter.clone();
        let gate = gate.clone();
        loader_fn(move |key: String| {
            let counter = counter.clone();
            let gate = gate.clone();
            async move {
                counter.hit(&key);
                if key == "slow" {
                    gate.wait().await;
                }
                Ok::<_, io::Error>(key.to_uppercase())
            }
        })
    };
    let cache = CacheInstance::new("independent", loader, REFRESH, CLEAR);

    let slow = tokio::spawn({
        let cache = cache.clone();
        async move { cache.get("slow").await }
    });
    sleep(ms(1)).await;
    assert_eq!(counter.hits("slow"), 1);

    let fast = cache.get("fast").await.unwrap();
    assert_eq!(fast.value.as_str(), "FAST");
    assert!(!slow.is_finished());

    gate.open(1);
    let slow = slow.await.unwrap().unwrap();
    assert_eq!(slow.value.as_str(), "SLOW");
}

#[tokio::test(start_paused = true)]
async fn test_cold_load_failure_releases_waiters() {
    test::setup();
    let counter = HitCounter::new();
    let gate = Gate::new();
    let loader = {
        let counter = counter.clone();
        let gate = gate.clone();
        loader_fn(move |key: String| {
            let counter = counter.clone();
            let gate = gate.clone();
            async move {
                let n = counter.hit(&key);
                gate.wait().await;
                if n == 1 {
                    return Err(io::Error::other("backend unavailable"));
                }
                Ok(format!("{key}-v{n}"))
            }
        })
    };
    let cache = CacheInstance::new("cold_failure", loader, REFRESH, CLEAR);

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get("k").await })
        })
        .collect();
    sleep(ms(1)).await;
    assert_eq!(cache.len(), 1);
    assert!(cache.peek("k").is_none());

    gate.open(1);
    for waiter in join_all(waiters).await {
        assert_eq!(
            waiter.unwrap().unwrap_err(),
            CacheError::LoadFailed("backend unavailable".into())
        );
    }
    assert_eq!(counter.hits("k"), 1);
    assert!(cache.is_empty());

    // the key was forgotten, so the next lookup loads it again
    gate.open(1);
    let entry = cache.get("k").await.unwrap();
    assert_eq!(entry.value.as_str(), "k-v2");
    assert_eq!(counter.hits("k"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cold_load_panic() {
    test::setup();
    let counter = HitCounter::new();
    let loader = {
        let counter = counter.clone();
        loader_fn(move |key: String| {
            let counter = counter.clone();
            async move {
                if counter.hit(&key) == 1 {
                    panic!("loader bug");
                }
                Ok::<_, io::Error>(key)
            }
        })
    };
    let cache = CacheInstance::new("cold_panic", loader, REFRESH, CLEAR);

    assert_eq!(cache.get("k").await.unwrap_err(), CacheError::InternalError);
    assert!(cache.is_empty());

    assert_eq!(cache.get("k").await.unwrap().value.as_str(), "k");
}

#[tokio::test(start_paused = true)]
async fn test_refresh_failure_reverts_and_retries() {
    test::setup();
    let counter = HitCounter::new();
    let loader = {
        let counter = counter.clone();
        loader_fn(move |key: String| {
            let counter = counter.clone();
            async move {
                let n = counter.hit(&key);
                sleep(ms(10)).await;
                if n == 2 {
                    return Err(io::Error::other("timeout"));
                }
                Ok(format!("{key}-v{n}"))
            }
        })
    };
    let cache = CacheInstance::new("refresh_failure", loader, REFRESH, Duration::from_secs(60));

    let first = cache.get("k").await.unwrap();
    sleep(ms(120)).await;

    let entry = cache.get("k").await.unwrap();
    assert_eq!(entry.state, EntryState::Loading);
    sleep(ms(20)).await;

    // the failed refresh keeps the old value and its load time
    let entry = cache.peek("k").unwrap();
    assert_eq!(entry.value.as_str(), "k-v1");
    assert_eq!(entry.state, EntryState::Loaded);
    assert_eq!(entry.loaded_at, first.loaded_at);
    assert_eq!(entry.refresh_error, Some(CacheError::LoadFailed("timeout".into())));

    // still stale, so the next lookup tries again
    let entry = cache.get("k").await.unwrap();
    assert_eq!(entry.value.as_str(), "k-v1");
    assert_eq!(entry.state, EntryState::Loading);
    assert!(entry.refresh_error.is_some());
    sleep(ms(20)).await;

    let entry = cache.get("k").await.unwrap();
    assert_eq!(entry.value.as_str(), "k-v3");
    assert_eq!(entry.state, EntryState::Loaded);
    assert_eq!(entry.refresh_error, None);
    assert_eq!(counter.hits("k"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_eviction_during_refresh_reinserts() {
    test::setup();
    let counter = HitCounter::new();
    let gate = Gate::new();
    let cache = CacheInstance::new("evict_refresh", gated_refresh(&counter, &gate), REFRESH, CLEAR);

    cache.get("k").await.unwrap();
    sleep(ms(120)).await;
    assert_eq!(cache.get("k").await.unwrap().state, EntryState::Loading);

    sleep(ms(40)).await;
    assert_eq!(cache.sweep(), 1);
    assert!(cache.is_empty());

    gate.open(1);
    sleep(ms(1)).await;

    let entry = cache.peek("k").unwrap();
    assert_eq!(entry.value.as_str(), "k-v2");
    assert_eq!(entry.state, EntryState::Loaded);
    assert_eq!(counter.hits("k"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_of_replaced_entry_is_discarded() {
    test::setup();
    let counter = HitCounter::new();
    let gate = Gate::new();
    let cache = CacheInstance::new("replaced", gated_refresh(&counter, &gate), REFRESH, CLEAR);

    cache.get("k").await.unwrap();
    sleep(ms(120)).await;
    cache.get("k").await.unwrap();
    sleep(ms(40)).await;

    // evicts the refreshing entry and starts a new cold load
    let reload = tokio::spawn({
        let cache = cache.clone();
        async move { cache.get("k").await }
    });
    sleep(ms(1)).await;
    assert_eq!(counter.hits("k"), 3);

    // the refresh finishes first, but the key now belongs to the new load
    gate.open(1);
    sleep(ms(1)).await;
    assert!(cache.peek("k").is_none());

    gate.open(1);
    let entry = reload.await.unwrap().unwrap();
    assert_eq!(entry.value.as_str(), "k-v3");
    assert_eq!(cache.peek("k").unwrap().value.as_str(), "k-v3");
}

#[tokio::test(start_paused = true)]
async fn test_peek_and_sweep() {
    test::setup();
    let counter = HitCounter::new();
    let cache = CacheInstance::new("peek", versioned(&counter, Duration::ZERO), REFRESH, CLEAR);

    assert!(cache.peek("k").is_none());
    assert_eq!(counter.accesses(), 0);

    cache.get("a").await.unwrap();
    sleep(ms(100)).await;
    cache.get("b").await.unwrap();
    assert_eq!(cache.len(), 2);

    // `peek` neither refreshes stale keys nor sweeps
    sleep(ms(60)).await;
    assert_eq!(cache.peek("a").unwrap().state, EntryState::Loaded);
    assert_eq!(cache.len(), 2);

    assert_eq!(cache.sweep(), 1);
    assert!(cache.peek("a").is_none());
    assert!(cache.peek("b").is_some());
    assert_eq!(counter.accesses(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_limit() {
    test::setup();
    let counter = HitCounter::new();
    let gate = Gate::new();
    let registry = CacheRegistry::with_refresh_limit(1);
    let cache = registry.get_or_create(
        "limited",
        gated_refresh(&counter, &gate),
        REFRESH,
        Duration::from_secs(60),
    );

    cache.get("a").await.unwrap();
    cache.get("b").await.unwrap();
    sleep(ms(120)).await;

    assert_eq!(cache.get("a").await.unwrap().state, EntryState::Loading);
    // no refresh slot left, served stale without a refresh
    let b = cache.get("b").await.unwrap();
    assert_eq!(b.state, EntryState::Loaded);
    assert_eq!(b.value.as_str(), "b-v1");
    sleep(ms(1)).await;
    assert_eq!(counter.hits("b"), 1);

    gate.open(1);
    sleep(ms(1)).await;
    assert_eq!(cache.peek("a").unwrap().value.as_str(), "a-v2");

    // the finished refresh returned its slot
    assert_eq!(cache.get("b").await.unwrap().state, EntryState::Loading);
    gate.open(1);
    sleep(ms(1)).await;
    assert_eq!(cache.peek("b").unwrap().value.as_str(), "b-v2");
}

#[tokio::test(start_paused = true)]
async fn test_every_stale_key_refreshes_by_default() {
    test::setup();
    let counter = HitCounter::new();
    let gate = Gate::new();
    let registry = CacheRegistry::new();
    let cache = registry.get_or_create(
        "unbounded",
        gated_refresh(&counter, &gate),
        REFRESH,
        Duration::from_secs(60),
    );

    let keys: Vec<_> = (0..100).map(|i| format!("key-{i}")).collect();
    for key in &keys {
        cache.get(key).await.unwrap();
    }
    sleep(ms(120)).await;

    // all refreshes are in flight at the same time
    for key in &keys {
        assert_eq!(cache.get(key).await.unwrap().state, EntryState::Loading);
    }
    sleep(ms(1)).await;
    for key in &keys {
        assert_eq!(counter.hits(key), 2);
    }

    gate.open(keys.len());
    sleep(ms(1)).await;
    for key in &keys {
        let entry = cache.peek(key).unwrap();
        assert_eq!(entry.state, EntryState::Loaded);
        assert_eq!(entry.value.as_str(), format!("{key}-v2"));
    }
}

#[tokio::test(start_paused = true)]
async fn test_registry_singleton() {
    test::setup();
    let first_counter = HitCounter::new();
    let second_counter = HitCounter::new();
    let registry = CacheRegistry::new();
    assert!(registry.is_empty());

    let first = registry.get_or_create(
        "users",
        versioned(&first_counter, Duration::ZERO),
        Duration::from_secs(3600),
        CLEAR,
    );
    first.get("alice").await.unwrap();

    let second = registry.get_or_create(
        "users",
        versioned(&second_counter, Duration::ZERO),
        REFRESH,
        Duration::from_secs(60),
    );
    assert!(first.ptr_eq(&second));
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.names(), vec!["users".to_owned()]);

    // intervals are updated for everyone, loader and entries are kept
    assert_eq!(first.refresh_interval(), REFRESH);
    assert_eq!(first.clear_interval(), Duration::from_secs(60));
    assert_eq!(second.len(), 1);
    second.get("bob").await.unwrap();
    assert_eq!(first_counter.accesses(), 2);
    assert_eq!(second_counter.accesses(), 0);

    // the shorter refresh interval applies to the existing entry
    sleep(ms(120)).await;
    assert_eq!(second.get("alice").await.unwrap().state, EntryState::Loading);

    assert!(registry.get("users").unwrap().ptr_eq(&first));
    assert!(registry.get("sessions").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_registry_from_config() {
    test::setup();
    let mut config = CacheConfig::default();
    config.instances.insert(
        "sessions".to_owned(),
        InstanceConfig {
            refresh_interval: ms(100),
            clear_interval: ms(50),
        },
    );
    let registry = CacheRegistry::from_config(&config);
    let counter = HitCounter::new();

    let sessions = registry.get_or_create_configured("sessions", versioned(&counter, Duration::ZERO));
    assert_eq!(sessions.refresh_interval(), ms(100));
    assert_eq!(sessions.clear_interval(), ms(50));

    let other = registry.get_or_create_configured("other", versioned(&counter, Duration::ZERO));
    assert_eq!(other.intervals(), Intervals {
        refresh: InstanceConfig::default().refresh_interval,
        clear: InstanceConfig::default().clear_interval,
    });
}

#[tokio::test]
async fn test_registry_concurrent_creation() {
    test::setup();
    let registry = std::sync::Arc::new(CacheRegistry::<String>::new());
    let counter = HitCounter::new();

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let registry = std::sync::Arc::clone(&registry);
            let counter = counter.clone();
            tokio::spawn(async move {
                let cache = registry.get_or_create(
                    "shared",
                    versioned(&counter, Duration::ZERO),
                    REFRESH,
                    CLEAR,
                );
                cache.get("k").await.unwrap()
            })
        })
        .collect();

    for task in join_all(tasks).await {
        assert_eq!(task.unwrap().value.as_str(), "k-v1");
    }
    assert_eq!(registry.len(), 1);
    assert_eq!(counter.hits("k"), 1);
}
