//! Query client - main entry point for cached, deduplicated fetches.

use crate::abort::{AbortController, AbortSignal};
use crate::error::{FetchError, QueryError, Result};
use crate::key::QueryKey;
use crate::mutation::{MutationOptions, MutationRunner};
use crate::retry::{should_retry, RetryDelay, RetryPredicate};
use crate::store::{
    CacheStore, EntryUpdate, FetchSlot, QueryState, QueryStatus, StoreConfig, StoreStats,
    Subscription,
};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Default freshness window used by [`QueryClient::query`] and [`QueryClient::prefetch`].
pub const DEFAULT_STALE_TIME: Duration = Duration::from_secs(5 * 60);

/// Default number of attempts per fetch, the first one included.
pub const DEFAULT_RETRY: u32 = 3;

/// Per-call options for [`QueryClient::fetch`] and friends.
///
/// # Example
///
/// ```
/// use query_kit::{FetchError, QueryOptions, RetryDelay};
/// use std::time::Duration;
///
/// let options = QueryOptions::<String>::default()
///     .with_retry(5)
///     .with_retry_delay(RetryDelay::Fixed(Duration::from_millis(200)))
///     .with_stale_time(Duration::from_secs(30))
///     .with_retry_if(|err: &FetchError| err.status_code() != Some(404))
///     .on_success(|value: &String| println!("fetched {}", value));
/// # let _ = options;
/// ```
pub struct QueryOptions<T> {
    /// Total attempts, the first one included. `0` behaves like `1`.
    pub retry: u32,

    /// Wait between a retryable failure and the next attempt.
    pub retry_delay: RetryDelay,

    /// How long a successful entry counts as fresh.
    pub stale_time: Duration,

    /// GC delay for this key once unobserved.
    ///
    /// - **If `Some(duration)`**: stored on the entry and used for every later GC of that key
    /// - **If `None`**: the entry keeps its previous value, else the store default applies
    pub cache_time: Option<Duration>,

    /// Overrides [`FetchError::is_retryable`].
    pub retry_if: Option<RetryPredicate>,

    /// Invoked once after a successful fetch. Panics are caught and logged.
    pub on_success: Option<Arc<dyn Fn(&T) + Send + Sync>>,

    /// Invoked once after a terminal failure. Panics are caught and logged.
    pub on_error: Option<Arc<dyn Fn(&QueryError) + Send + Sync>>,
}

impl<T> Default for QueryOptions<T> {
    fn default() -> Self {
        QueryOptions {
            retry: DEFAULT_RETRY,
            retry_delay: RetryDelay::default(),
            stale_time: DEFAULT_STALE_TIME,
            cache_time: None,
            retry_if: None,
            on_success: None,
            on_error: None,
        }
    }
}

impl<T> Clone for QueryOptions<T> {
    fn clone(&self) -> Self {
        QueryOptions {
            retry: self.retry,
            retry_delay: self.retry_delay.clone(),
            stale_time: self.stale_time,
            cache_time: self.cache_time,
            retry_if: self.retry_if.clone(),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
        }
    }
}

impl<T> fmt::Debug for QueryOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("retry", &self.retry)
            .field("retry_delay", &self.retry_delay)
            .field("stale_time", &self.stale_time)
            .field("cache_time", &self.cache_time)
            .field("retry_if", &self.retry_if.is_some())
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl<T> QueryOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the total number of attempts.
    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: RetryDelay) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    pub fn with_cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = Some(cache_time);
        self
    }

    /// Classify failures with `predicate` instead of the built-in heuristics.
    pub fn with_retry_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&FetchError) -> bool + Send + Sync + 'static,
    {
        self.retry_if = Some(Arc::new(predicate));
        self
    }

    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(callback));
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&QueryError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

/// Run a user callback, logging instead of propagating a panic.
pub(crate) fn run_callback(what: &str, key: &str, callback: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
        warn!("{} callback for {} panicked", what, key);
    }
}

/// Client for cached async queries.
///
/// Cheap to clone; clones share the same [`CacheStore`]. Construct one per isolated cache.
///
/// # Example
///
/// ```
/// use query_kit::{query_key, FetchError, QueryClient, QueryOptions};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> query_kit::Result<()> {
/// let client = QueryClient::new();
/// let key = query_key!["repo", "r1"];
///
/// let stars: u32 = client
///     .fetch(&key, |_signal| async { Ok::<_, FetchError>(42) }, &QueryOptions::default())
///     .await?;
/// assert_eq!(stars, 42);
/// assert_eq!(client.get_query_data::<u32>(&key), Some(42));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct QueryClient {
    store: CacheStore,
}

impl QueryClient {
    /// Create a client over a fresh store with default settings.
    pub fn new() -> Self {
        Self::with_store(CacheStore::new())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        Self::with_store(CacheStore::with_config(config))
    }

    /// Create a client over an existing store.
    pub fn with_store(store: CacheStore) -> Self {
        QueryClient { store }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Fetch `key`, joining an in-flight attempt for the same key if there is one.
    ///
    /// Cached data is not consulted; see [`query`](Self::query) for the cache-first variant.
    ///
    /// The owning call drives the attempt loop: up to `options.retry` attempts, waiting
    /// `options.retry_delay` after each retryable failure. Callers that join receive the
    /// outcome of the attempt they joined and never call `fetch_fn`.
    ///
    /// # Errors
    ///
    /// - `QueryError::Fetch`: terminal failure, stored on the entry
    /// - `QueryError::Cancelled`: the attempt was aborted, or the entry was removed while joined
    /// - `QueryError::CancelledDuringRetry`: aborted while waiting out a retry delay
    /// - `QueryError::TypeMismatch`: a joined attempt produced a different type than `T`
    pub async fn fetch<T, F, Fut, E>(
        &self,
        key: &QueryKey,
        fetch_fn: F,
        options: &QueryOptions<T>,
    ) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(AbortSignal) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<FetchError>,
    {
        let cache_key = key.to_cache_key();
        match self.store.claim_or_join(&cache_key, options.cache_time) {
            FetchSlot::Joined {
                receiver,
                subscription,
            } => self.join(&cache_key, receiver, subscription).await,
            FetchSlot::Owner(controller) => {
                self.drive(&cache_key, controller, fetch_fn, options)
                    .await
            }
        }
    }

    /// Serve fresh cached data for `key`, otherwise [`fetch`](Self::fetch).
    ///
    /// Data is fresh when the entry is `success` and younger than `options.stale_time`.
    pub async fn query<T, F, Fut, E>(
        &self,
        key: &QueryKey,
        fetch_fn: F,
        options: &QueryOptions<T>,
    ) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(AbortSignal) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<FetchError>,
    {
        let cache_key = key.to_cache_key();
        if let Some(state) = self.store.get(&cache_key) {
            if state.is_success() && !state.is_stale(options.stale_time) {
                self.store.metrics().record_hit(&cache_key);
                return read_data(&cache_key, &state);
            }
        }
        self.fetch(key, fetch_fn, options).await
    }

    /// Warm the cache for `key`.
    ///
    /// Calls [`fetch`](Self::fetch) only when the entry is absent, not `success`, or stale.
    /// Cancellation is swallowed; other failures propagate.
    pub async fn prefetch<T, F, Fut, E>(
        &self,
        key: &QueryKey,
        fetch_fn: F,
        options: &QueryOptions<T>,
    ) -> Result<()>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(AbortSignal) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<FetchError>,
    {
        let cache_key = key.to_cache_key();
        let needed = match self.store.get(&cache_key) {
            Some(state) => !state.is_success() || state.is_stale(options.stale_time),
            None => true,
        };
        if !needed {
            debug!("Prefetch skipped, {} is fresh", cache_key);
            return Ok(());
        }

        match self.fetch(key, fetch_fn, options).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_cancellation() => {
                debug!("Prefetch of {} cancelled", cache_key);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Cached data for `key`, if present and of type `T`.
    pub fn get_query_data<T>(&self, key: &QueryKey) -> Option<T>
    where
        T: Clone + 'static,
    {
        self.store
            .get(&key.to_cache_key())
            .and_then(|state| state.data_as::<T>().cloned())
    }

    /// Write `data` as a fresh `success` entry and notify subscribers.
    pub fn set_query_data<T>(&self, key: &QueryKey, data: T)
    where
        T: Send + Sync + 'static,
    {
        let cache_key = key.to_cache_key();
        self.store.set(
            &cache_key,
            EntryUpdate::new()
                .data(data)
                .status(QueryStatus::Success)
                .timestamp(Some(Instant::now()))
                .clear_error()
                .retry_count(0),
        );
        self.store.notify(&cache_key);
        let cache_time = self.store.cache_time_for(&cache_key);
        self.store.schedule_gc(&cache_key, cache_time);
    }

    pub fn get_query_state(&self, key: &QueryKey) -> Option<QueryState> {
        self.store.get(&key.to_cache_key())
    }

    /// Register `callback` for every state change of `key`.
    pub fn subscribe<F>(&self, key: &QueryKey, callback: F) -> Subscription
    where
        F: Fn(&QueryState) + Send + Sync + 'static,
    {
        self.store.subscribe(&key.to_cache_key(), callback)
    }

    /// Mark entries under `prefix` (all entries when `None`) as needing a refetch.
    ///
    /// Data is kept; status becomes `idle` and the timestamp is cleared.
    pub fn invalidate_queries(&self, prefix: Option<&QueryKey>) -> usize {
        match prefix {
            Some(prefix) => self.store.invalidate_where(|key| prefix.matches(key)),
            None => self.store.invalidate(None),
        }
    }

    /// Delete entries under `prefix`, aborting their in-flight fetches. `None` clears the store.
    pub fn remove_queries(&self, prefix: Option<&QueryKey>) -> usize {
        match prefix {
            Some(prefix) => self.store.remove_where(|key| prefix.matches(key)),
            None => self.store.clear(),
        }
    }

    /// Abort in-flight operations under `prefix` (all of them when `None`).
    ///
    /// Aborted fetches reset their entry to `idle`; cached data is kept.
    pub fn cancel_queries(&self, prefix: Option<&QueryKey>) -> usize {
        match prefix {
            Some(prefix) => self.store.aborts().abort_where(|key| prefix.matches(key)),
            None => self.store.aborts().abort_all(),
        }
    }

    /// Number of operations currently registered as in flight.
    pub fn fetching_count(&self) -> usize {
        self.store.aborts().len()
    }

    pub fn get_stats(&self) -> StoreStats {
        self.store.stats()
    }

    /// Build a mutation runner whose in-flight call is reachable through
    /// [`cancel_queries`](Self::cancel_queries).
    pub fn mutation<I, O, F, Fut, E>(
        &self,
        mutation_fn: F,
        options: MutationOptions<I, O>,
    ) -> MutationRunner<I, O>
    where
        I: Clone + Send + Sync + 'static,
        O: Clone + Send + Sync + 'static,
        F: Fn(I, AbortSignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<O, E>> + Send + 'static,
        E: Into<FetchError> + Send + 'static,
    {
        MutationRunner::with_registry(mutation_fn, options, self.store.aborts().clone())
    }

    // ------------------------------------------------------------------------
    // Attempt loop
    // ------------------------------------------------------------------------

    async fn join<T>(
        &self,
        key: &str,
        receiver: oneshot::Receiver<QueryState>,
        subscription: Subscription,
    ) -> Result<T>
    where
        T: Clone + 'static,
    {
        let settled = receiver.await;
        drop(subscription);

        // A dropped sender means the entry was removed while we waited.
        let state = settled.map_err(|_| QueryError::Cancelled)?;
        match state.status {
            QueryStatus::Success => read_data(key, &state),
            QueryStatus::Error => Err(state
                .error
                .unwrap_or_else(|| QueryError::Fetch(FetchError::new("fetch failed")))),
            QueryStatus::Idle | QueryStatus::Loading => Err(QueryError::Cancelled),
        }
    }

    async fn drive<T, F, Fut, E>(
        &self,
        key: &str,
        controller: AbortController,
        fetch_fn: F,
        options: &QueryOptions<T>,
    ) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(AbortSignal) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<FetchError>,
    {
        let mut guard = InFlight {
            store: &self.store,
            key,
            controller: &controller,
            armed: true,
        };
        let signal = controller.signal();
        let metrics = self.store.metrics();
        let started = Instant::now();
        let mut attempt: u32 = 1;

        loop {
            let outcome: std::result::Result<T, FetchError> = tokio::select! {
                biased;
                _ = signal.aborted() => Err(FetchError::aborted()),
                result = fetch_fn(signal.clone()) => result.map_err(Into::into),
            };

            let error = match outcome {
                Ok(data) => {
                    let written = self.store.settle(
                        key,
                        controller.id(),
                        EntryUpdate::new()
                            .data(data.clone())
                            .status(QueryStatus::Success)
                            .timestamp(Some(Instant::now()))
                            .clear_error()
                            .retry_count(0),
                    );
                    guard.disarm();
                    metrics.record_fetch(key, started.elapsed(), true);

                    if let Some(callback) = &options.on_success {
                        run_callback("on_success", key, || callback(&data));
                    }
                    if written {
                        self.schedule_gc(key, options);
                    } else {
                        debug!("Fetch for {} was superseded, result not cached", key);
                    }
                    return Ok(data);
                }
                Err(error) => error,
            };

            if signal.is_aborted() || error.is_aborted() {
                guard.cancel();
                return Err(QueryError::Cancelled);
            }

            if attempt < options.retry && should_retry(&error, options.retry_if.as_ref()) {
                let delay = options.retry_delay.delay(attempt);
                metrics.record_retry(key, attempt, delay);
                self.store.modify(key, |entry| {
                    if entry.owned_by(controller.id()) {
                        entry.retry_count = attempt;
                    }
                });

                let cancelled = tokio::select! {
                    biased;
                    _ = signal.aborted() => true,
                    _ = tokio::time::sleep(delay) => false,
                };
                if cancelled {
                    guard.cancel();
                    return Err(QueryError::CancelledDuringRetry { attempt });
                }

                attempt += 1;
                continue;
            }

            if attempt > 1 {
                warn!("Fetch for {} gave up after {} attempts: {}", key, attempt, error);
            }

            let error = QueryError::Fetch(error);
            let written = self.store.settle(
                key,
                controller.id(),
                EntryUpdate::new()
                    .error(error.clone())
                    .status(QueryStatus::Error)
                    .timestamp(Some(Instant::now()))
                    .retry_count(attempt),
            );
            guard.disarm();
            metrics.record_fetch(key, started.elapsed(), false);
            metrics.record_error(key, &error.to_string());

            if let Some(callback) = &options.on_error {
                run_callback("on_error", key, || callback(&error));
            }
            if written {
                self.schedule_gc(key, options);
            }
            return Err(error);
        }
    }

    fn schedule_gc<T>(&self, key: &str, options: &QueryOptions<T>) {
        let cache_time = options
            .cache_time
            .unwrap_or_else(|| self.store.cache_time_for(key));
        self.store.schedule_gc(key, cache_time);
    }
}

fn read_data<T>(key: &str, state: &QueryState) -> Result<T>
where
    T: Clone + 'static,
{
    match state.data.as_deref() {
        Some(data) => downcast::<T>(key, data),
        None => Err(QueryError::TypeMismatch {
            key: key.to_string(),
            expected: std::any::type_name::<T>(),
        }),
    }
}

fn downcast<T>(key: &str, data: &(dyn Any + Send + Sync)) -> Result<T>
where
    T: Clone + 'static,
{
    data.downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| QueryError::TypeMismatch {
            key: key.to_string(),
            expected: std::any::type_name::<T>(),
        })
}

/// Owner-side bookkeeping of one fetch attempt.
///
/// Releases the registry entry on every exit path. While armed (the attempt has not settled
/// the entry), dropping it aborts the controller and resets the entry to `idle`.
struct InFlight<'a> {
    store: &'a CacheStore,
    key: &'a str,
    controller: &'a AbortController,
    armed: bool,
}

impl InFlight<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }

    fn cancel(&mut self) {
        self.armed = false;
        self.store.reset_cancelled(self.key, self.controller.id());
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.controller.abort();
            self.store.reset_cancelled(self.key, self.controller.id());
        }
        self.store.aborts().release(self.key, self.controller.id());
    }
}
