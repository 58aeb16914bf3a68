//! Integration tests for query-cache
//!
//! These tests drive the public API end to end: bindings, shared entries,
//! invalidation and the optimistic mutation protocol.

use query_cache::{
    CacheConfig, CacheMetrics, OptimisticUpdate, QueryCache, QueryKey, QueryOptions,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// Test data definition
#[derive(Clone, Debug, PartialEq)]
struct Visit {
    id: String,
    caregiver: String,
    start: String,
}

fn visit(id: &str, caregiver: &str, start: &str) -> Visit {
    Visit {
        id: id.to_string(),
        caregiver: caregiver.to_string(),
        start: start.to_string(),
    }
}

fn visits_key() -> QueryKey {
    QueryKey::builder("calendar-dashboard")
        .push_or(None::<&str>, "unlocked")
        .push_or(None::<&str>, "all")
        .build()
        .expect("Failed to build key")
}

/// Fetch that counts its calls and takes `delay` to resolve with `value`.
fn slow_fetch<T>(
    calls: &Arc<AtomicUsize>,
    delay: Duration,
    value: T,
) -> impl Fn() -> futures::future::BoxFuture<'static, Result<T, String>> + Send + Sync + 'static
where
    T: Clone + Send + Sync + 'static,
{
    use futures::FutureExt;

    let calls = Arc::clone(calls);
    move || {
        calls.fetch_add(1, Ordering::SeqCst);
        let value = value.clone();
        async move {
            tokio::time::sleep(delay).await;
            Ok(value)
        }
        .boxed()
    }
}

/// Fetch that counts its calls and fails with `message` after `delay`.
fn failing_fetch(
    calls: &Arc<AtomicUsize>,
    delay: Duration,
    message: &'static str,
) -> impl Fn() -> futures::future::BoxFuture<'static, Result<u32, String>> + Send + Sync + 'static {
    use futures::FutureExt;

    let calls = Arc::clone(calls);
    move || {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(delay).await;
            Err(message.to_string())
        }
        .boxed()
    }
}

/// Fetch that blocks its worker thread for `block`, then yields `value`.
fn blocking_fetch(
    block: Duration,
    value: u32,
) -> impl Fn() -> futures::future::BoxFuture<'static, Result<u32, String>> + Send + Sync + 'static {
    use futures::FutureExt;

    move || {
        async move {
            std::thread::sleep(block);
            Ok(value)
        }
        .boxed()
    }
}

#[derive(Default)]
struct Counters {
    fresh_hits: AtomicUsize,
    coalesced: AtomicUsize,
    started: AtomicUsize,
    failed: AtomicUsize,
    invalidated: AtomicUsize,
}

struct CountingMetrics(Arc<Counters>);

impl CacheMetrics for CountingMetrics {
    fn record_fresh_hit(&self, _key: &str) {
        self.0.fresh_hits.fetch_add(1, Ordering::SeqCst);
    }

    fn record_coalesced(&self, _key: &str) {
        self.0.coalesced.fetch_add(1, Ordering::SeqCst);
    }

    fn record_fetch_started(&self, _key: &str) {
        self.0.started.fetch_add(1, Ordering::SeqCst);
    }

    fn record_fetch_settled(&self, _key: &str, _duration: Duration, ok: bool) {
        if !ok {
            self.0.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn record_invalidate(&self, _key: &str) {
        self.0.invalidated.fetch_add(1, Ordering::SeqCst);
    }
}

/// Test 1: Request coalescing
///
/// A binds at t=0, B binds at t=5 while A's 10ms fetch is running.
/// One fetch runs and both bindings see its data when it settles.
#[tokio::test(start_paused = true)]
async fn test_concurrent_bindings_share_one_fetch() {
    let cache = QueryCache::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let roster = vec![visit("v1", "c1", "09:00")];

    let a = cache.bind(
        QueryOptions::new(visits_key()),
        slow_fetch(&calls, Duration::from_millis(10), roster.clone()),
    );
    let b = cache.bind(
        QueryOptions::new(visits_key()),
        slow_fetch(&calls, Duration::from_millis(10), roster.clone()),
    );

    let started = tokio::time::Instant::now();
    tokio::join!(a.activate(), async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(a.is_fetching(), "A should still be waiting at t=5");
        b.activate().await;
    });

    assert_eq!(calls.load(Ordering::SeqCst), 1, "Fetch should run once");
    assert!(started.elapsed() >= Duration::from_millis(10));
    assert!(started.elapsed() < Duration::from_millis(15));
    assert_eq!(a.data(), Some(roster.clone()));
    assert_eq!(b.data(), Some(roster));
    assert!(!a.is_fetching());
    assert!(!b.is_fetching());
}

/// Test 2: Failure keeps previous data
///
/// A failed refetch records its error but never discards cached data.
#[tokio::test]
async fn test_failed_refetch_keeps_data() {
    let cache = QueryCache::new();
    let key = QueryKey::builder("pending-coverage-claims").build().expect("Failed to build key");
    cache.set_query_data(&key, vec![visit("v1", "c1", "09:00")]);

    let binding = cache.bind(QueryOptions::new(key.clone()), || async {
        Err::<Vec<Visit>, _>("network down")
    });
    binding.refetch().await;

    let state = binding.state();
    assert_eq!(state.data, Some(vec![visit("v1", "c1", "09:00")]));
    assert_eq!(state.error.as_deref(), Some("network down"));
    assert!(!state.is_loading);
    let entry = cache.entry::<Vec<Visit>>(&key).expect("Entry missing");
    assert!(entry.updated_at.is_some(), "Failure should stamp updated_at");

    // A later success clears the error.
    cache.set_query_data(&key, Vec::<Visit>::new());
    assert_eq!(binding.error(), None);
}

/// Test 3: Fresh hit
///
/// Data younger than the staleness window is served without any fetch.
#[tokio::test(start_paused = true)]
async fn test_fresh_data_skips_fetch() {
    let cache = QueryCache::new();
    let key = QueryKey::builder("admin-clients").build().expect("Failed to build key");
    cache.set_query_data(&key, vec!["Ada".to_string()]);

    tokio::time::advance(Duration::from_secs(30)).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let binding = cache.bind(
        QueryOptions::new(key.clone()).stale_time(Duration::from_secs(60)),
        slow_fetch(&calls, Duration::ZERO, vec!["Grace".to_string()]),
    );
    binding.activate().await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(binding.data(), Some(vec!["Ada".to_string()]));

    // Past the window the same binding fetches.
    tokio::time::advance(Duration::from_secs(31)).await;
    binding.activate().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(binding.data(), Some(vec!["Grace".to_string()]));
}

/// Test 4: Invalidate preserves data
///
/// Invalidation only clears freshness; the next activation refetches while
/// the old data stays readable.
#[tokio::test]
async fn test_invalidate_then_refetch() {
    let cache = QueryCache::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = QueryKey::builder("access-users").build().expect("Failed to build key");

    let binding = cache.bind(
        QueryOptions::new(key.clone()),
        slow_fetch(&calls, Duration::ZERO, 3u32),
    );
    binding.activate().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert!(cache.invalidate(&key));
    assert_eq!(binding.data(), Some(3), "Stale data should stay visible");

    binding.activate().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

/// Test 5: Prefix scope
///
/// Invalidating `["dash","a"]` covers `["dash","a"]` and `["dash","a","b"]`
/// but not `["dash","ab"]`.
#[test]
fn test_prefix_invalidation_scope() {
    let cache = QueryCache::new();
    let exact = QueryKey::segments(["dash", "a"]).expect("Failed to build key");
    let nested = QueryKey::segments(["dash", "a", "b"]).expect("Failed to build key");
    let sibling = QueryKey::segments(["dash", "ab"]).expect("Failed to build key");
    for key in [&exact, &nested, &sibling] {
        cache.set_query_data(key, 1u8);
    }

    let count = cache.invalidate_prefix(&exact);

    assert_eq!(count, 2);
    assert!(cache.entry::<u8>(&exact).expect("Entry missing").updated_at.is_none());
    assert!(cache.entry::<u8>(&nested).expect("Entry missing").updated_at.is_none());
    assert!(cache.entry::<u8>(&sibling).expect("Entry missing").updated_at.is_some());
    assert_eq!(cache.stats().stale_entries, 2);
}

/// Test 6: Optimistic rollback
///
/// Data D0, optimistic write D1, effect fails: data is D0 again and the
/// effect's error reaches the caller.
#[tokio::test]
async fn test_failed_mutation_rolls_back() {
    let cache = QueryCache::new();
    let key = visits_key();
    let d0 = vec![visit("v1", "c1", "09:00")];
    cache.set_query_data(&key, d0.clone());

    let observed = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen = Arc::clone(&observed);
    let reader = cache.clone();
    let reader_key = key.clone();
    let _sub = cache.subscribe(&key, move || {
        if let Some(data) = reader.get_query_data::<Vec<Visit>>(&reader_key) {
            seen.lock().expect("Lock poisoned").push(data);
        }
    });

    let result = cache
        .mutate(
            &key,
            |prev: Option<&Vec<Visit>>| {
                prev.map(|visits| {
                    visits
                        .iter()
                        .map(|v| visit(&v.id, &v.caregiver, "10:00"))
                        .collect()
                })
            },
            || async { Err::<(), _>("slot taken".to_string()) },
        )
        .await;

    assert_eq!(result, Err("slot taken".to_string()));
    assert_eq!(cache.get_query_data::<Vec<Visit>>(&key), Some(d0.clone()));

    let observed = observed.lock().expect("Lock poisoned");
    assert_eq!(observed.len(), 2, "Observers should see D1 then D0");
    assert_eq!(observed[0][0].start, "10:00");
    assert_eq!(observed[1], d0);
}

/// Test 7: Successful mutation reconciles
///
/// The binding's mutation keeps the optimistic value visible, then
/// invalidates and refetches the server's view.
#[tokio::test]
async fn test_successful_mutation_refetches() {
    let cache = QueryCache::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let server_view = vec![visit("v1", "c2", "11:00")];

    let binding = cache.bind(
        QueryOptions::new(visits_key()),
        slow_fetch(&calls, Duration::ZERO, server_view.clone()),
    );
    cache.set_query_data(&visits_key(), vec![visit("v1", "c1", "09:00")]);

    let reassigned = binding
        .mutate(
            |prev: Option<&Vec<Visit>>| {
                prev.map(|visits| {
                    visits
                        .iter()
                        .map(|v| visit(&v.id, "c2", &v.start))
                        .collect()
                })
            },
            || async { Ok::<_, String>("v1") },
        )
        .await;

    assert_eq!(reassigned, Ok("v1"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(binding.data(), Some(server_view));
}

/// Test 8: Counter scenario
///
/// A "+1 when present" updater on a missing entry never creates one.
/// Seeding has to be explicit.
#[test]
fn test_counter_requires_seed() {
    let cache = QueryCache::new();
    let key = QueryKey::text("counter").expect("Failed to build key");

    for _ in 0..3 {
        cache.update_query_data(&key, |prev: Option<&i64>| prev.map(|n| n + 1));
    }
    assert_eq!(cache.get_query_data::<i64>(&key), None);

    cache.set_query_data(&key, 0i64);
    for _ in 0..3 {
        cache.update_query_data(&key, |prev: Option<&i64>| prev.map(|n| n + 1));
    }
    assert_eq!(cache.get_query_data::<i64>(&key), Some(3));
}

/// Test 9: Multi-key mutation
///
/// An update confirmed against a family prefix marks every related query
/// stale.
#[test]
fn test_optimistic_update_with_family_invalidation() {
    let cache = QueryCache::new();
    let unlocked = visits_key();
    let caregiver = QueryKey::builder("calendar-dashboard")
        .push("caregiver")
        .push("c1")
        .build()
        .expect("Failed to build key");
    let unrelated = QueryKey::builder("admin-clients").build().expect("Failed to build key");
    cache.set_query_data(&unlocked, vec![visit("v1", "c1", "09:00")]);
    cache.set_query_data(&caregiver, vec![visit("v1", "c1", "09:00")]);
    cache.set_query_data(&unrelated, 7u32);

    let update = OptimisticUpdate::apply(&cache, &unlocked, |prev: Option<&Vec<Visit>>| {
        prev.map(|_| Vec::new())
    });
    let family = QueryKey::builder("calendar-dashboard").build().expect("Failed to build key");
    assert_eq!(update.confirm_with_prefix(&family), 2);

    assert_eq!(cache.get_query_data::<Vec<Visit>>(&unlocked), Some(Vec::new()));
    assert!(cache.entry::<u32>(&unrelated).expect("Entry missing").updated_at.is_some());
}

/// Test 10: Cancellation
///
/// Cancelling a running fetch settles every waiter, records the
/// cancellation and keeps any previous data.
#[tokio::test(start_paused = true)]
async fn test_cancel_running_fetch() {
    let cache = QueryCache::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = QueryKey::builder("roles").build().expect("Failed to build key");
    cache.set_query_data(&key, vec!["viewer".to_string()]);
    cache.invalidate(&key);

    let binding = cache.bind(
        QueryOptions::new(key.clone()),
        slow_fetch(&calls, Duration::from_secs(5), vec!["admin".to_string()]),
    );

    tokio::join!(binding.activate(), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.cancel(&key));
    });

    let entry = cache.entry::<Vec<String>>(&key).expect("Entry missing");
    assert_eq!(entry.data, Some(vec!["viewer".to_string()]));
    assert_eq!(entry.error.as_deref(), Some("fetch cancelled"));
    assert!(!entry.is_fetching);
    assert!(!binding.is_fetching());
    assert!(!cache.cancel(&key), "Nothing left to cancel");
}

/// Test 11: Detached consumer
///
/// Dropping a binding mid-fetch does not stop the fetch; its result is
/// still written for everyone else.
#[tokio::test(start_paused = true)]
async fn test_dropped_binding_fetch_still_writes() {
    let cache = QueryCache::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = QueryKey::builder("admin-clients").build().expect("Failed to build key");

    let binding = cache.bind(
        QueryOptions::new(key.clone()),
        slow_fetch(&calls, Duration::from_millis(10), 42u32),
    );
    let pending = tokio::time::timeout(Duration::from_millis(2), binding.activate()).await;
    assert!(pending.is_err(), "Fetch should still be running");
    drop(binding);

    assert_eq!(cache.stats().subscribers, 0);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(cache.get_query_data::<u32>(&key), Some(42));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// Test 12: Teardown
///
/// Teardown aborts in-flight fetches; the aborted fetch never writes.
#[tokio::test(start_paused = true)]
async fn test_teardown_aborts_fetches() {
    let cache = QueryCache::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = QueryKey::builder("access-users").build().expect("Failed to build key");

    let binding = cache.bind(
        QueryOptions::new(key.clone()),
        slow_fetch(&calls, Duration::from_millis(10), 1u32),
    );
    let (_, _) = tokio::join!(binding.activate(), async {
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(cache.stats().in_flight_entries, 1);
        cache.teardown();
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(cache.stats().total_entries, 0);
    assert_eq!(cache.get_query_data::<u32>(&key), None);
}

/// Test 13: Metrics
///
/// Fresh hits, coalesced joins, started fetches, failures and
/// invalidations are each reported once.
#[tokio::test(start_paused = true)]
async fn test_metrics_are_reported() {
    let counters = Arc::new(Counters::default());
    let cache = QueryCache::with_metrics(
        CacheConfig::default(),
        Box::new(CountingMetrics(Arc::clone(&counters))),
    );
    let calls = Arc::new(AtomicUsize::new(0));
    let key = QueryKey::builder("access-users").build().expect("Failed to build key");

    let a = cache.bind(
        QueryOptions::new(key.clone()),
        slow_fetch(&calls, Duration::from_millis(10), 1u32),
    );
    let b = cache.bind(
        QueryOptions::new(key.clone()),
        slow_fetch(&calls, Duration::from_millis(10), 1u32),
    );
    tokio::join!(a.activate(), b.activate());
    a.activate().await;
    cache.invalidate(&key);

    let roles = QueryKey::text("roles").expect("Failed to build key");
    let failing = cache.bind(QueryOptions::new(roles), || async { Err::<u32, _>("denied") });
    failing.activate().await;

    assert_eq!(counters.started.load(Ordering::SeqCst), 2);
    assert_eq!(counters.coalesced.load(Ordering::SeqCst), 1);
    assert_eq!(counters.fresh_hits.load(Ordering::SeqCst), 1);
    assert_eq!(counters.failed.load(Ordering::SeqCst), 1);
    assert_eq!(counters.invalidated.load(Ordering::SeqCst), 1);
}

/// Test 14: Configuration
///
/// The configured fallback message replaces blank failures and the
/// configured stale time applies to bindings without their own.
#[tokio::test(start_paused = true)]
async fn test_config_from_json() {
    let config = CacheConfig::from_json(
        r#"{ "stale_time_ms": 1000, "fallback_error_message": "Try again later." }"#,
    )
    .expect("Config should parse");
    let cache = QueryCache::with_config(config);

    let blank_key = QueryKey::text("blank").expect("Failed to build key");
    let blank = cache.bind(QueryOptions::new(blank_key), || async { Err::<u32, _>("  ") });
    blank.activate().await;
    assert_eq!(blank.error().as_deref(), Some("Try again later."));

    let calls = Arc::new(AtomicUsize::new(0));
    let binding = cache.bind(
        QueryOptions::new(QueryKey::text("short-lived").expect("Failed to build key")),
        slow_fetch(&calls, Duration::ZERO, 1u32),
    );
    assert_eq!(binding.stale_time(), Duration::from_secs(1));
    binding.activate().await;
    tokio::time::advance(Duration::from_millis(1500)).await;
    binding.activate().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

/// Test 15: Scheduled refresh
///
/// A refresh scheduled after a remote write invalidates the entry and
/// refetches once its delay has passed.
#[tokio::test(start_paused = true)]
async fn test_scheduled_refresh_reconciles() {
    let cache = QueryCache::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = QueryKey::builder("shared-calendar")
        .push("client")
        .push("c1")
        .build()
        .expect("Failed to build key");

    let binding = cache.bind(
        QueryOptions::new(key.clone()),
        slow_fetch(&calls, Duration::ZERO, 5u32),
    );
    binding.activate().await;

    let mut changed = binding.changed();
    binding.schedule_refresh(Duration::from_millis(10));
    changed.changed().await.expect("Binding dropped");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(!binding.is_fetching());
}

/// Test 16: Shared failure
///
/// Two bindings joined on one failing fetch both report its error. The
/// failure stamps `updated_at`, so activating again inside the window
/// serves cached data and error without another fetch.
#[tokio::test(start_paused = true)]
async fn test_joined_bindings_share_failure() {
    let cache = QueryCache::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = QueryKey::builder("admin-clients").build().expect("Failed to build key");
    cache.set_query_data(&key, 1u32);
    let seeded_at = cache
        .entry::<u32>(&key)
        .and_then(|entry| entry.updated_at)
        .expect("Seed not stamped");
    cache.invalidate(&key);

    let a = cache.bind(
        QueryOptions::new(key.clone()),
        failing_fetch(&calls, Duration::from_millis(10), "down"),
    );
    let b = cache.bind(
        QueryOptions::new(key.clone()),
        failing_fetch(&calls, Duration::from_millis(10), "down"),
    );
    tokio::join!(a.activate(), b.activate());

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.error().as_deref(), Some("down"));
    assert_eq!(b.error().as_deref(), Some("down"));

    let entry = cache.entry::<u32>(&key).expect("Entry missing");
    assert_eq!(entry.data, Some(1), "Failure must not discard data");
    let failed_at = entry.updated_at.expect("Failure should stamp updated_at");
    assert!(failed_at > seeded_at);

    tokio::time::advance(Duration::from_secs(5)).await;
    a.activate().await;
    b.activate().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1, "Inside the window nothing refetches");
    assert_eq!(a.state().error.as_deref(), Some("down"));
    assert_eq!(a.state().data, Some(1));
}

/// Test 17: Cancel during the final poll
///
/// The fetch is already running its last poll on another worker when it is
/// cancelled. Its result must not land: previous data stays, the entry stays
/// stale and records the cancellation.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_discards_result_of_running_poll() {
    let cache = QueryCache::new();
    let key = QueryKey::builder("roles").build().expect("Failed to build key");
    cache.set_query_data(&key, 3u32);
    cache.invalidate(&key);

    let binding = Arc::new(cache.bind(
        QueryOptions::new(key.clone()),
        blocking_fetch(Duration::from_millis(50), 7),
    ));
    let running = Arc::clone(&binding);
    let handle = tokio::spawn(async move { running.activate().await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(cache.cancel(&key));
    handle.await.expect("Activation task failed");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let entry = cache.entry::<u32>(&key).expect("Entry missing");
    assert_eq!(entry.data, Some(3));
    assert_eq!(entry.error.as_deref(), Some("fetch cancelled"));
    assert!(entry.updated_at.is_none());
    assert!(!entry.is_fetching);
}

/// Test 18: Teardown during the final poll
///
/// A fetch that settles after teardown never re-creates its entry.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_teardown_discards_result_of_running_poll() {
    let cache = QueryCache::new();
    let key = QueryKey::builder("access-users").build().expect("Failed to build key");

    let binding = Arc::new(cache.bind(
        QueryOptions::new(key.clone()),
        blocking_fetch(Duration::from_millis(50), 7),
    ));
    let running = Arc::clone(&binding);
    let handle = tokio::spawn(async move { running.activate().await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    cache.teardown();
    handle.await.expect("Activation task failed");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(cache.stats().total_entries, 0);
    assert_eq!(cache.get_query_data::<u32>(&key), None);
}
