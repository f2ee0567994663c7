//! Integration tests for query-kit
//!
//! These tests verify end-to-end query behavior across the client, the store and the abort
//! registry. Timer-dependent tests run on a paused tokio clock.

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use query_kit::store::EntryUpdate;
use query_kit::{
    query_key, AbortSignal, CacheStore, FetchError, QueryClient, QueryError, QueryKey,
    QueryMetrics, QueryOptions, QueryStatus, RetryDelay, StoreConfig,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Fetch function that sleeps `delay`, then returns `value`, counting its calls.
fn slow_value<T>(
    calls: Arc<AtomicU32>,
    delay: Duration,
    value: T,
) -> impl Fn(AbortSignal) -> BoxFuture<'static, Result<T, FetchError>>
where
    T: Clone + Send + 'static,
{
    move |_signal: AbortSignal| -> BoxFuture<'static, Result<T, FetchError>> {
        calls.fetch_add(1, Ordering::SeqCst);
        let value = value.clone();
        async move {
            tokio::time::sleep(delay).await;
            Ok(value)
        }
        .boxed()
    }
}

/// Fetch function that fails with `status` for the first `failures` calls, then returns `value`.
fn failing_then<T>(
    calls: Arc<AtomicU32>,
    failures: u32,
    status: u16,
    value: T,
) -> impl Fn(AbortSignal) -> BoxFuture<'static, Result<T, FetchError>>
where
    T: Clone + Send + 'static,
{
    move |_signal: AbortSignal| -> BoxFuture<'static, Result<T, FetchError>> {
        let call = calls.fetch_add(1, Ordering::SeqCst);
        let value = value.clone();
        async move {
            if call < failures {
                Err(FetchError::status(status, "server said no"))
            } else {
                Ok(value)
            }
        }
        .boxed()
    }
}

/// Fetch function that only finishes when its signal is aborted.
fn until_aborted<T: Send + 'static>(
) -> impl Fn(AbortSignal) -> BoxFuture<'static, Result<T, FetchError>> {
    |signal: AbortSignal| -> BoxFuture<'static, Result<T, FetchError>> {
        async move {
            signal.aborted().await;
            Err(FetchError::aborted())
        }
        .boxed()
    }
}

/// Test 1: Deduplication
///
/// Two concurrent fetches of `["repo","r1"]` both resolve to 42 with a single call.
#[tokio::test(start_paused = true)]
async fn test_concurrent_fetches_share_one_call() {
    init_logger();
    let client = QueryClient::new();
    let key = query_key!["repo", "r1"];
    let calls = Arc::new(AtomicU32::new(0));
    let options = QueryOptions::default();

    let fetch_fn = slow_value(calls.clone(), Duration::from_millis(10), 42_u32);
    let (a, b) = tokio::join!(
        client.fetch(&key, &fetch_fn, &options),
        client.fetch(&key, &fetch_fn, &options),
    );

    assert_eq!(a, Ok(42));
    assert_eq!(b, Ok(42));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// Test 2: Deduplication with many callers
#[tokio::test(start_paused = true)]
async fn test_many_callers_join_one_attempt() {
    let client = QueryClient::new();
    let key = query_key!["repo", "r2"];
    let calls = Arc::new(AtomicU32::new(0));
    let options = QueryOptions::default();
    let fetch_fn = slow_value(calls.clone(), Duration::from_millis(50), "shared".to_string());

    let results = join_all((0..10).map(|_| client.fetch(&key, &fetch_fn, &options))).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for result in results {
        assert_eq!(result.as_deref(), Ok("shared"));
    }
}

/// Test 3: Joined callers see the same failure
#[tokio::test(start_paused = true)]
async fn test_joined_callers_share_failure() {
    let client = QueryClient::new();
    let key = query_key!["broken"];
    let calls = Arc::new(AtomicU32::new(0));

    let counter = calls.clone();
    let fetch_fn = move |_signal: AbortSignal| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err::<u32, _>(FetchError::status(403, "forbidden"))
        }
    };
    let options = QueryOptions::default();

    let (a, b) = tokio::join!(
        client.fetch(&key, &fetch_fn, &options),
        client.fetch(&key, &fetch_fn, &options),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(a, Err(QueryError::Fetch(_))));
    assert_eq!(a, b);
}

/// Test 4: Retry until success
///
/// 500 twice then "ok" with retry = 3: the value is "ok" and the retry count is reset.
#[tokio::test(start_paused = true)]
async fn test_retryable_failures_then_success() {
    init_logger();
    let client = QueryClient::new();
    let key = query_key!["flaky"];
    let calls = Arc::new(AtomicU32::new(0));
    let options = QueryOptions::default().with_retry(3);

    let started = tokio::time::Instant::now();
    let value = client
        .fetch(
            &key,
            failing_then(calls.clone(), 2, 500, "ok".to_string()),
            &options,
        )
        .await
        .expect("Fetch should succeed on third attempt");

    assert_eq!(value, "ok");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // 1s after the first failure, 2s after the second.
    assert_eq!(started.elapsed(), Duration::from_secs(3));

    let state = client.get_query_state(&key).expect("Entry missing");
    assert_eq!(state.status, QueryStatus::Success);
    assert_eq!(state.retry_count, 0);
    assert!(state.error.is_none());
}

/// Test 5: Terminal failure
///
/// A 400 fails immediately: no retry, status error, retry count 1.
#[tokio::test(start_paused = true)]
async fn test_client_error_is_not_retried() {
    let client = QueryClient::new();
    let key = query_key!["bad-request"];
    let calls = Arc::new(AtomicU32::new(0));

    let err = client
        .fetch(
            &key,
            failing_then(calls.clone(), u32::MAX, 400, 0_u8),
            &QueryOptions::default(),
        )
        .await
        .expect_err("400 should fail");

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(err.as_fetch_error().and_then(FetchError::status_code), Some(400));

    let state = client.get_query_state(&key).expect("Entry missing");
    assert_eq!(state.status, QueryStatus::Error);
    assert_eq!(state.retry_count, 1);
    assert_eq!(state.error, Some(err));
    assert!(state.timestamp.is_some());
}

/// Test 6: Retry bound
///
/// With `m` retryable failures and `retry = r`, the call succeeds iff `m < r` and the fetch
/// function runs `min(m + 1, r)` times.
#[tokio::test(start_paused = true)]
async fn test_retry_bound() {
    let client = QueryClient::new();

    for retry in 1..=4_u32 {
        for failures in 0..=5_u32 {
            let key = query_key!["bound", retry, failures];
            let calls = Arc::new(AtomicU32::new(0));
            let options = QueryOptions::default()
                .with_retry(retry)
                .with_retry_delay(RetryDelay::Fixed(Duration::from_millis(5)));

            let result = client
                .fetch(&key, failing_then(calls.clone(), failures, 503, ()), &options)
                .await;

            assert_eq!(result.is_ok(), failures < retry, "retry={} m={}", retry, failures);
            assert_eq!(calls.load(Ordering::SeqCst), (failures + 1).min(retry));

            let state = client.get_query_state(&key).expect("Entry missing");
            let expected_count = if failures < retry { 0 } else { retry };
            assert_eq!(state.retry_count, expected_count);
        }
    }
}

/// Test 7: Fresh cache hit
#[tokio::test(start_paused = true)]
async fn test_query_uses_fresh_cache() {
    let client = QueryClient::new();
    let key = query_key!["user", 7];
    let calls = Arc::new(AtomicU32::new(0));
    let options = QueryOptions::default().with_stale_time(Duration::from_secs(30));
    let fetch_fn = slow_value(calls.clone(), Duration::from_millis(1), 7_u64);

    assert_eq!(client.query(&key, &fetch_fn, &options).await, Ok(7));
    assert_eq!(client.query(&key, &fetch_fn, &options).await, Ok(7));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // fetch always goes to the source.
    assert_eq!(client.fetch(&key, &fetch_fn, &options).await, Ok(7));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

/// Test 8: Prefetch stale check
#[tokio::test(start_paused = true)]
async fn test_prefetch_respects_stale_time() {
    let client = QueryClient::new();
    let key = query_key!["repo", "readme"];
    let calls = Arc::new(AtomicU32::new(0));
    let options = QueryOptions::default().with_stale_time(Duration::from_secs(60));
    let fetch_fn = slow_value(calls.clone(), Duration::from_millis(1), "# readme".to_string());

    client
        .prefetch(&key, &fetch_fn, &options)
        .await
        .expect("Prefetch failed");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_secs(30)).await;
    client
        .prefetch(&key, &fetch_fn, &options)
        .await
        .expect("Prefetch failed");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_secs(31)).await;
    client
        .prefetch(&key, &fetch_fn, &options)
        .await
        .expect("Prefetch failed");
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // Invalidated entries are refetched regardless of age.
    client.invalidate_queries(Some(&key));
    client
        .prefetch(&key, &fetch_fn, &options)
        .await
        .expect("Prefetch failed");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

/// Test 9: Prefetch propagates failures but swallows cancellation
#[tokio::test(start_paused = true)]
async fn test_prefetch_error_handling() {
    let client = QueryClient::new();
    let key = query_key!["prefetch", "fails"];
    let calls = Arc::new(AtomicU32::new(0));

    let result = client
        .prefetch(
            &key,
            failing_then(calls.clone(), u32::MAX, 404, ()),
            &QueryOptions::default(),
        )
        .await;
    assert!(matches!(result, Err(QueryError::Fetch(_))));

    let cancelled_key = query_key!["prefetch", "cancelled"];
    let prefetch = {
        let client = client.clone();
        let key = cancelled_key.clone();
        tokio::spawn(async move {
            client
                .prefetch(&key, until_aborted::<u8>(), &QueryOptions::default())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(client.cancel_queries(Some(&cancelled_key)), 1);

    let result = prefetch.await.expect("Task failed");
    assert_eq!(result, Ok(()));
}

/// Test 10: Eviction cap
///
/// 101 idle unobserved keys against a cap of 100 leave exactly 100 entries, minus the oldest.
#[tokio::test(start_paused = true)]
async fn test_eviction_cap() {
    let client = QueryClient::with_config(StoreConfig::default().with_max_entries(100));
    let store = client.store();

    for i in 0..101 {
        store.set(
            &query_key!["item", i].to_cache_key(),
            EntryUpdate::new().timestamp(Some(tokio::time::Instant::now())),
        );
        tokio::time::advance(Duration::from_millis(1)).await;
    }

    assert_eq!(store.len(), 100);
    assert!(!store.contains(&query_key!["item", 0].to_cache_key()));
    assert!(store.contains(&query_key!["item", 1].to_cache_key()));
    assert!(store.contains(&query_key!["item", 100].to_cache_key()));
}

/// Test 11: Observed entries survive eviction
#[tokio::test(start_paused = true)]
async fn test_eviction_skips_subscribed_entries() {
    let client = QueryClient::with_config(StoreConfig::default().with_max_entries(2));
    let oldest = query_key!["oldest"];
    let _watch = client.subscribe(&oldest, |_| {});

    client.set_query_data(&oldest, 1_u8);
    tokio::time::advance(Duration::from_millis(1)).await;
    client.set_query_data(&query_key!["middle"], 2_u8);
    tokio::time::advance(Duration::from_millis(1)).await;
    client.set_query_data(&query_key!["newest"], 3_u8);

    assert_eq!(client.store().len(), 2);
    assert_eq!(client.get_query_data::<u8>(&oldest), Some(1));
    assert_eq!(client.get_query_data::<u8>(&query_key!["middle"]), None);
    assert_eq!(client.get_query_data::<u8>(&query_key!["newest"]), Some(3));
}

/// Test 12: GC after cache time
#[tokio::test(start_paused = true)]
async fn test_gc_after_cache_time() {
    let client = QueryClient::new();
    let key = query_key!["gc"];
    let calls = Arc::new(AtomicU32::new(0));
    let options = QueryOptions::default().with_cache_time(Duration::from_secs(30));

    client
        .fetch(&key, slow_value(calls, Duration::from_millis(1), 1_u8), &options)
        .await
        .expect("Fetch failed");

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert!(client.get_query_state(&key).is_some());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(client.get_query_state(&key).is_none());
}

/// Test 13: A subscriber cancels pending GC
#[tokio::test(start_paused = true)]
async fn test_subscriber_cancels_gc() {
    let client = QueryClient::new();
    let key = query_key!["gc", "watched"];
    let calls = Arc::new(AtomicU32::new(0));
    let options = QueryOptions::default().with_cache_time(Duration::from_secs(30));

    client
        .fetch(&key, slow_value(calls, Duration::from_millis(1), 1_u8), &options)
        .await
        .expect("Fetch failed");

    tokio::time::sleep(Duration::from_secs(10)).await;
    let subscription = client.subscribe(&key, |_| {});
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(client.get_query_state(&key).is_some());

    // Unobserved again: collected one cache time later.
    drop(subscription);
    tokio::time::sleep(Duration::from_secs(29)).await;
    assert!(client.get_query_state(&key).is_some());
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(client.get_query_state(&key).is_none());
}

/// Test 14: Invalidate vs remove
#[tokio::test(start_paused = true)]
async fn test_invalidate_keeps_data_remove_deletes() {
    let client = QueryClient::new();
    let repo_a = query_key!["repo", "a"];
    let repo_b = query_key!["repo", "b"];
    let repository = query_key!["repository"];
    for key in [&repo_a, &repo_b, &repository] {
        client.set_query_data(key, key.to_string());
    }

    assert_eq!(client.invalidate_queries(Some(&query_key!["repo"])), 2);
    let state = client.get_query_state(&repo_a).expect("Entry missing");
    assert_eq!(state.status, QueryStatus::Idle);
    assert!(state.timestamp.is_none());
    assert_eq!(client.get_query_data::<String>(&repo_a), Some(repo_a.to_string()));
    assert_eq!(
        client.get_query_state(&repository).map(|s| s.status),
        Some(QueryStatus::Success)
    );

    assert_eq!(client.remove_queries(Some(&query_key!["repo"])), 2);
    assert!(client.get_query_state(&repo_a).is_none());
    assert!(client.get_query_state(&repo_b).is_none());
    assert!(client.get_query_state(&repository).is_some());

    assert_eq!(client.remove_queries(None), 1);
    assert!(client.store().is_empty());
}

/// Test 15: Remove aborts the in-flight fetch
#[tokio::test(start_paused = true)]
async fn test_remove_aborts_in_flight_fetch() {
    let client = QueryClient::new();
    let key = query_key!["remove", "me"];

    let owner = {
        let client = client.clone();
        let key = key.clone();
        tokio::spawn(async move {
            client
                .fetch(&key, until_aborted::<u8>(), &QueryOptions::default())
                .await
        })
    };
    let joiner = {
        let client = client.clone();
        let key = key.clone();
        tokio::spawn(async move {
            client
                .fetch(&key, until_aborted::<u8>(), &QueryOptions::default())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(client.fetching_count(), 1);

    assert_eq!(client.remove_queries(Some(&key)), 1);

    assert_eq!(owner.await.expect("Task failed"), Err(QueryError::Cancelled));
    assert_eq!(joiner.await.expect("Task failed"), Err(QueryError::Cancelled));
    assert_eq!(client.fetching_count(), 0);
    assert!(client.get_query_state(&key).is_none());
}

/// Test 16: Cancellation resets to idle and keeps previous data
#[tokio::test(start_paused = true)]
async fn test_cancel_resets_entry_to_idle() {
    let client = QueryClient::new();
    let key = query_key!["cancel"];
    client.set_query_data(&key, 1_u8);

    let owner = {
        let client = client.clone();
        let key = key.clone();
        tokio::spawn(async move {
            client
                .fetch(&key, until_aborted::<u8>(), &QueryOptions::default())
                .await
        })
    };
    let joiner = {
        let client = client.clone();
        let key = key.clone();
        tokio::spawn(async move {
            client
                .fetch(&key, until_aborted::<u8>(), &QueryOptions::default())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(
        client.get_query_state(&key).map(|s| s.status),
        Some(QueryStatus::Loading)
    );

    assert_eq!(client.cancel_queries(None), 1);

    assert_eq!(owner.await.expect("Task failed"), Err(QueryError::Cancelled));
    assert_eq!(joiner.await.expect("Task failed"), Err(QueryError::Cancelled));

    let state = client.get_query_state(&key).expect("Entry missing");
    assert_eq!(state.status, QueryStatus::Idle);
    assert!(!state.is_fetching);
    assert!(state.error.is_none());
    assert_eq!(state.data_as::<u8>(), Some(&1));
    assert_eq!(client.fetching_count(), 0);
}

/// Test 17: Cancellation during the retry wait
#[tokio::test(start_paused = true)]
async fn test_cancel_during_retry_delay() {
    let client = QueryClient::new();
    let key = query_key!["cancel", "retry"];
    let calls = Arc::new(AtomicU32::new(0));

    let task = {
        let client = client.clone();
        let key = key.clone();
        let calls = calls.clone();
        tokio::spawn(async move {
            client
                .fetch(
                    &key,
                    failing_then(calls, u32::MAX, 502, ()),
                    &QueryOptions::default(),
                )
                .await
        })
    };

    // First attempt fails at once; the task then waits 1s before the second.
    tokio::time::sleep(Duration::from_millis(500)).await;
    client.cancel_queries(Some(&key));

    assert_eq!(
        task.await.expect("Task failed"),
        Err(QueryError::CancelledDuringRetry { attempt: 1 })
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let state = client.get_query_state(&key).expect("Entry missing");
    assert_eq!(state.status, QueryStatus::Idle);
    assert!(state.error.is_none());
}

/// Test 18: Subscribers see every transition in order
#[tokio::test(start_paused = true)]
async fn test_subscriber_sees_transitions() {
    let client = QueryClient::new();
    let key = query_key!["observed"];
    let seen = Arc::new(Mutex::new(Vec::new()));

    let log = seen.clone();
    let _subscription = client.subscribe(&key, move |state| log.lock().push(state.status));

    let calls = Arc::new(AtomicU32::new(0));
    client
        .fetch(
            &key,
            slow_value(calls, Duration::from_millis(1), 1_u8),
            &QueryOptions::default(),
        )
        .await
        .expect("Fetch failed");
    client.invalidate_queries(None);

    assert_eq!(
        *seen.lock(),
        vec![QueryStatus::Loading, QueryStatus::Success, QueryStatus::Idle]
    );
}

/// Test 19: Stats snapshot
#[tokio::test(start_paused = true)]
async fn test_stats_ordering() {
    let client = QueryClient::new();
    let keys: Vec<QueryKey> = (0..3).map(|i| query_key!["stats", i]).collect();

    for key in &keys {
        client.set_query_data(key, ());
        tokio::time::advance(Duration::from_secs(1)).await;
    }

    let stats = client.get_stats();
    assert_eq!(stats.size, 3);
    let ordered: Vec<String> = stats.entries.iter().map(|e| e.key.clone()).collect();
    let expected: Vec<String> = keys.iter().map(QueryKey::to_cache_key).collect();
    assert_eq!(ordered, expected);
    assert_eq!(stats.entries[0].age, Some(Duration::from_secs(3)));
    assert!(stats.entries.iter().all(|e| e.status == QueryStatus::Success));
}

/// Test 20: A new attempt over an invalidated in-flight fetch aborts the old one
#[tokio::test(start_paused = true)]
async fn test_superseded_attempt_is_aborted() {
    let client = QueryClient::new();
    let key = query_key!["superseded"];
    let options = QueryOptions::default();

    let first = {
        let client = client.clone();
        let key = key.clone();
        let options = options.clone();
        tokio::spawn(async move { client.fetch(&key, until_aborted::<&str>(), &options).await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;

    // Invalidation lets the next fetch start its own attempt.
    client.invalidate_queries(Some(&key));
    let second = client
        .fetch(&key, |_signal| async { Ok::<_, FetchError>("new") }, &options)
        .await;
    assert_eq!(second, Ok("new"));

    assert_eq!(first.await.expect("Task failed"), Err(QueryError::Cancelled));
    assert_eq!(client.get_query_data::<&str>(&key), Some("new"));
    assert_eq!(client.get_query_state(&key).map(|s| s.status), Some(QueryStatus::Success));
    assert_eq!(client.fetching_count(), 0);
}

/// Test 21: A cancelled refetch re-arms garbage collection
#[tokio::test(start_paused = true)]
async fn test_cancelled_refetch_is_still_collected() {
    let client = QueryClient::new();
    let key = query_key!["cancelled-gc"];
    let options = QueryOptions::default().with_cache_time(Duration::from_secs(30));

    client
        .fetch(&key, |_signal| async { Ok::<_, FetchError>(1_u8) }, &options)
        .await
        .expect("Fetch failed");

    let refetch = {
        let client = client.clone();
        let key = key.clone();
        let options = options.clone();
        tokio::spawn(async move { client.fetch(&key, until_aborted::<u8>(), &options).await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(client.cancel_queries(None), 1);
    assert_eq!(refetch.await.expect("Task failed"), Err(QueryError::Cancelled));
    assert!(client.get_query_state(&key).is_some());

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(client.get_query_state(&key).is_none());
}

/// Test 22: on_error runs once per terminal failure, never on cancellation
#[tokio::test(start_paused = true)]
async fn test_on_error_callback() {
    let client = QueryClient::new();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let options = {
        let errors = errors.clone();
        QueryOptions::<u8>::default().on_error(move |error: &QueryError| {
            errors.lock().push(error.to_string());
            panic!("broken error handler");
        })
    };

    let key = query_key!["on-error", "terminal"];
    let calls = Arc::new(AtomicU32::new(0));
    let err = client
        .fetch(&key, failing_then(calls.clone(), 5, 404, 0_u8), &options)
        .await
        .expect_err("Fetch should fail");
    assert_eq!(err.as_fetch_error().and_then(FetchError::status_code), Some(404));
    assert_eq!(errors.lock().len(), 1);

    // The panicking handler did not corrupt the entry.
    let state = client.get_query_state(&key).expect("Entry missing");
    assert_eq!(state.status, QueryStatus::Error);
    assert!(!state.is_fetching);

    let key = query_key!["on-error", "cancelled"];
    let cancelled = {
        let client = client.clone();
        let key = key.clone();
        let options = options.clone();
        tokio::spawn(async move { client.fetch(&key, until_aborted::<u8>(), &options).await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    client.cancel_queries(Some(&key));
    assert_eq!(cancelled.await.expect("Task failed"), Err(QueryError::Cancelled));
    assert_eq!(errors.lock().len(), 1);
}

/// Metrics handler recording every hook call.
#[derive(Default)]
struct RecordingMetrics {
    events: Mutex<Vec<String>>,
}

impl QueryMetrics for RecordingMetrics {
    fn record_dedup(&self, key: &str) {
        self.events.lock().push(format!("dedup {}", key));
    }

    fn record_eviction(&self, key: &str) {
        self.events.lock().push(format!("evict {}", key));
    }

    fn record_gc(&self, key: &str) {
        self.events.lock().push(format!("gc {}", key));
    }
}

/// Test 23: Custom metrics receive dedup, eviction and GC events
#[tokio::test(start_paused = true)]
async fn test_custom_metrics_hooks() {
    let metrics = Arc::new(RecordingMetrics::default());
    let config = StoreConfig::default().with_max_entries(2);
    let client = QueryClient::with_store(CacheStore::with_metrics(config, metrics.clone()));
    let options = QueryOptions::default().with_cache_time(Duration::from_secs(10));
    let calls = Arc::new(AtomicU32::new(0));

    let key = query_key!["metrics", "shared"];
    let fetch = slow_value(calls.clone(), Duration::from_millis(10), 1_u8);
    let (a, b) = tokio::join!(
        client.fetch(&key, &fetch, &options),
        client.fetch(&key, &fetch, &options),
    );
    assert_eq!((a, b), (Ok(1), Ok(1)));

    let shared = key.to_cache_key();
    assert_eq!(*metrics.events.lock(), vec![format!("dedup {}", shared)]);

    // Never-settled entries are the oldest, so they go first.
    client.store().set("idle-1", EntryUpdate::new());
    client.store().set("idle-2", EntryUpdate::new());
    assert_eq!(client.get_stats().size, 2);
    assert!(metrics.events.lock().contains(&"evict idle-1".to_string()));

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(client.get_query_state(&key).is_none());
    assert!(metrics.events.lock().contains(&format!("gc {}", shared)));
}
