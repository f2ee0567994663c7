//! Mutation runner - one-shot side-effecting calls with cancel-previous semantics.
//!
//! A [`MutationRunner`] wraps one async mutation function. It tracks a single in-flight call:
//! starting a new one cancels the previous, and only the latest call publishes its state.
//! Nothing is cached by key; the runner's observable state is a [`MutationState`] published
//! through a `tokio::sync::watch` channel.
//!
//! ```
//! use query_kit::{FetchError, MutationOptions, MutationRunner, QueryStatus};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let runner = MutationRunner::new(
//!     |name: String, _signal| async move { Ok::<_, FetchError>(format!("created {}", name)) },
//!     MutationOptions::default(),
//! );
//!
//! let out = runner.mutate_async("repo".to_string()).await.expect("Mutation failed");
//! assert_eq!(out, "created repo");
//! assert_eq!(runner.state().status, QueryStatus::Success);
//! # }
//! ```

use crate::abort::{AbortController, AbortRegistry, AbortSignal};
use crate::client::run_callback;
use crate::error::{FetchError, QueryError, Result};
use crate::store::QueryStatus;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

static NEXT_MUTATION_ID: AtomicU64 = AtomicU64::new(1);

/// Future returned by a [`MutationFn`].
pub type MutationFuture<O> = BoxFuture<'static, std::result::Result<O, FetchError>>;

/// Type-erased mutation function.
pub type MutationFn<I, O> = Arc<dyn Fn(I, AbortSignal) -> MutationFuture<O> + Send + Sync>;

type SuccessFn<I, O> = Arc<dyn Fn(&O, &I) + Send + Sync>;
type ErrorFn<I> = Arc<dyn Fn(&QueryError, &I) + Send + Sync>;
type SettledFn<I, O> = Arc<dyn Fn(Option<&O>, Option<&QueryError>, &I) + Send + Sync>;

/// Observable state of a runner.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationState<O> {
    pub status: QueryStatus,
    pub data: Option<O>,
    pub error: Option<QueryError>,
}

impl<O> Default for MutationState<O> {
    fn default() -> Self {
        MutationState {
            status: QueryStatus::Idle,
            data: None,
            error: None,
        }
    }
}

impl<O> MutationState<O> {
    fn loading() -> Self {
        MutationState {
            status: QueryStatus::Loading,
            data: None,
            error: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == QueryStatus::Idle
    }

    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }
}

/// Callbacks and identity of a runner.
///
/// Each callback is invoked exactly once per finished call, `on_success`/`on_error` first and
/// `on_settled` after. Panics are caught and logged.
pub struct MutationOptions<I, O> {
    /// Key under which the in-flight call is registered in the [`AbortRegistry`].
    /// Defaults to a unique `mutation:<n>`.
    pub mutation_key: Option<String>,
    pub on_success: Option<SuccessFn<I, O>>,
    pub on_error: Option<ErrorFn<I>>,
    pub on_settled: Option<SettledFn<I, O>>,
}

impl<I, O> Default for MutationOptions<I, O> {
    fn default() -> Self {
        MutationOptions {
            mutation_key: None,
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }
}

impl<I, O> Clone for MutationOptions<I, O> {
    fn clone(&self) -> Self {
        MutationOptions {
            mutation_key: self.mutation_key.clone(),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            on_settled: self.on_settled.clone(),
        }
    }
}

impl<I, O> fmt::Debug for MutationOptions<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationOptions")
            .field("mutation_key", &self.mutation_key)
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_settled", &self.on_settled.is_some())
            .finish()
    }
}

impl<I, O> MutationOptions<I, O> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mutation_key(mut self, key: impl Into<String>) -> Self {
        self.mutation_key = Some(key.into());
        self
    }

    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: Fn(&O, &I) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(callback));
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&QueryError, &I) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub fn on_settled<F>(mut self, callback: F) -> Self
    where
        F: Fn(Option<&O>, Option<&QueryError>, &I) + Send + Sync + 'static,
    {
        self.on_settled = Some(Arc::new(callback));
        self
    }
}

struct MutationInner<I, O> {
    mutation_fn: MutationFn<I, O>,
    options: MutationOptions<I, O>,
    registry: AbortRegistry,
    key: String,
    current: Mutex<Option<AbortController>>,
    state: watch::Sender<MutationState<O>>,
}

/// Runs one mutation function, at most one call in flight.
///
/// Dropping the runner cancels the outstanding call.
pub struct MutationRunner<I, O> {
    inner: Arc<MutationInner<I, O>>,
}

impl<I, O> MutationRunner<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    /// Create a standalone runner with its own [`AbortRegistry`].
    pub fn new<F, Fut, E>(mutation_fn: F, options: MutationOptions<I, O>) -> Self
    where
        F: Fn(I, AbortSignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<O, E>> + Send + 'static,
        E: Into<FetchError> + Send + 'static,
    {
        Self::with_registry(mutation_fn, options, AbortRegistry::new())
    }

    /// Create a runner whose in-flight call is tracked in `registry`.
    pub fn with_registry<F, Fut, E>(
        mutation_fn: F,
        options: MutationOptions<I, O>,
        registry: AbortRegistry,
    ) -> Self
    where
        F: Fn(I, AbortSignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<O, E>> + Send + 'static,
        E: Into<FetchError> + Send + 'static,
    {
        let mutation_fn: MutationFn<I, O> = Arc::new(move |input: I, signal: AbortSignal| {
            let call = mutation_fn(input, signal);
            async move {
                let result: std::result::Result<O, FetchError> = call.await.map_err(Into::into);
                result
            }
            .boxed()
        });
        let key = options.mutation_key.clone().unwrap_or_else(|| {
            format!("mutation:{}", NEXT_MUTATION_ID.fetch_add(1, Ordering::Relaxed))
        });
        let (state, _) = watch::channel(MutationState::default());

        MutationRunner {
            inner: Arc::new(MutationInner {
                mutation_fn,
                options,
                registry,
                key,
                current: Mutex::new(None),
                state,
            }),
        }
    }

    /// Registry key of this runner's in-flight call.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Run the mutation and return its result.
    ///
    /// A call still in flight is cancelled first.
    ///
    /// # Errors
    ///
    /// - `QueryError::Fetch`: the mutation function failed
    /// - `QueryError::Cancelled`: the call was superseded, reset, or aborted through the registry
    pub async fn mutate_async(&self, input: I) -> Result<O> {
        self.inner.run(input).await
    }

    /// Fire-and-forget [`mutate_async`](Self::mutate_async). Failures are only logged and
    /// reported through callbacks and state.
    ///
    /// Must be called from within a tokio runtime.
    pub fn mutate(&self, input: I) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.run(input).await {
                debug!("Mutation {} failed: {}", inner.key, e);
            }
        })
    }

    /// Cancel any call in flight and return to `idle`.
    pub fn reset(&self) {
        self.inner.cancel_current();
        self.inner.state.send_replace(MutationState::default());
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> MutationState<O> {
        self.inner.state.borrow().clone()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<MutationState<O>> {
        self.inner.state.subscribe()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.state.borrow().is_loading()
    }
}

impl<I, O> Drop for MutationRunner<I, O> {
    fn drop(&mut self) {
        self.inner.cancel_current();
    }
}

impl<I, O> MutationInner<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    async fn run(&self, input: I) -> Result<O> {
        let controller = AbortController::new();
        let id = controller.id();

        let previous = self.current.lock().replace(controller.clone());
        if let Some(previous) = previous {
            debug!("Mutation {} superseded by a new call", self.key);
            previous.abort();
        }
        self.registry.register(&self.key, controller.clone());

        let mut guard = RunGuard {
            inner: self,
            id,
            settled: false,
        };
        self.publish(id, MutationState::loading());

        let signal = controller.signal();
        let outcome: std::result::Result<O, FetchError> = tokio::select! {
            biased;
            _ = signal.aborted() => Err(FetchError::aborted()),
            result = (self.mutation_fn)(input.clone(), signal.clone()) => result,
        };

        // A result that arrives after cancellation is never published as a success.
        let outcome = match outcome {
            Ok(_) | Err(_) if controller.is_aborted() => Err(QueryError::Cancelled),
            Ok(data) => Ok(data),
            Err(e) => Err(QueryError::from(e)),
        };
        guard.settled = true;

        match &outcome {
            Ok(data) => {
                self.publish(
                    id,
                    MutationState {
                        status: QueryStatus::Success,
                        data: Some(data.clone()),
                        error: None,
                    },
                );
                if let Some(callback) = &self.options.on_success {
                    run_callback("on_success", &self.key, || callback(data, &input));
                }
                if let Some(callback) = &self.options.on_settled {
                    run_callback("on_settled", &self.key, || callback(Some(data), None, &input));
                }
            }
            Err(error) => {
                self.publish(
                    id,
                    MutationState {
                        status: QueryStatus::Error,
                        data: None,
                        error: Some(error.clone()),
                    },
                );
                if let Some(callback) = &self.options.on_error {
                    run_callback("on_error", &self.key, || callback(error, &input));
                }
                if let Some(callback) = &self.options.on_settled {
                    run_callback("on_settled", &self.key, || callback(None, Some(error), &input));
                }
            }
        }

        outcome
    }

    /// Publish `state` only if the call `id` is still the current one.
    fn publish(&self, id: u64, state: MutationState<O>) -> bool {
        let current = self.current.lock();
        if current.as_ref().map(AbortController::id) != Some(id) {
            return false;
        }
        self.state.send_replace(state);
        true
    }
}

impl<I, O> MutationInner<I, O> {
    fn cancel_current(&self) {
        let current = self.current.lock().take();
        if let Some(controller) = current {
            controller.abort();
            self.registry.release(&self.key, controller.id());
        }
    }
}

/// Releases the registry entry and the current slot of one call on every exit path.
struct RunGuard<'a, I, O> {
    inner: &'a MutationInner<I, O>,
    id: u64,
    settled: bool,
}

impl<I, O> Drop for RunGuard<'_, I, O> {
    fn drop(&mut self) {
        let mut current = self.inner.current.lock();
        if current.as_ref().map(AbortController::id) == Some(self.id) {
            if let Some(controller) = current.take() {
                if !self.settled {
                    // The caller dropped the future mid-flight.
                    controller.abort();
                    self.inner.state.send_replace(MutationState::default());
                }
            }
        }
        drop(current);
        self.inner.registry.release(&self.inner.key, self.id);
    }
}
