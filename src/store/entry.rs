//! Per-key cache record and its read-only snapshot.

use crate::abort::AbortController;
use crate::error::QueryError;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Type-erased cached value.
pub type QueryData = Arc<dyn Any + Send + Sync>;

/// Notification callback registered against a key.
pub type SubscriberFn = Arc<dyn Fn(&QueryState) + Send + Sync>;

/// Lifecycle status of an entry.
///
/// `Idle -> Loading -> {Success, Error}`; `Success`/`Error -> Loading` on the next fetch; any
/// state may return to `Idle` through invalidation or cancellation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    #[default]
    Idle,
    Loading,
    Success,
    Error,
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryStatus::Idle => write!(f, "idle"),
            QueryStatus::Loading => write!(f, "loading"),
            QueryStatus::Success => write!(f, "success"),
            QueryStatus::Error => write!(f, "error"),
        }
    }
}

pub(crate) struct Subscriber {
    pub(crate) id: u64,
    pub(crate) callback: SubscriberFn,
}

/// One record of the [`CacheStore`](super::CacheStore).
pub(crate) struct CacheEntry {
    pub(crate) data: Option<QueryData>,
    pub(crate) error: Option<QueryError>,
    pub(crate) status: QueryStatus,
    /// Last success or error transition. `None` means never, or invalidated.
    pub(crate) timestamp: Option<Instant>,
    pub(crate) subscribers: Vec<Subscriber>,
    pub(crate) retry_count: u32,
    pub(crate) controller: Option<AbortController>,
    /// GC delay once the entry goes unobserved; store default when unset.
    pub(crate) cache_time: Option<Duration>,
    /// Creation order, used to break timestamp ties during eviction.
    pub(crate) seq: u64,
}

impl CacheEntry {
    pub(crate) fn new(seq: u64) -> Self {
        CacheEntry {
            data: None,
            error: None,
            status: QueryStatus::Idle,
            timestamp: None,
            subscribers: Vec::new(),
            retry_count: 0,
            controller: None,
            cache_time: None,
            seq,
        }
    }

    /// Unobserved, not loading and no fetch in flight.
    pub(crate) fn is_eligible(&self) -> bool {
        self.subscribers.is_empty()
            && self.status != QueryStatus::Loading
            && self.controller.is_none()
    }

    pub(crate) fn owned_by(&self, controller_id: u64) -> bool {
        self.controller
            .as_ref()
            .is_some_and(|controller| controller.id() == controller_id)
    }

    pub(crate) fn apply(&mut self, update: EntryUpdate) {
        if let Some(data) = update.data {
            self.data = data;
        }
        if let Some(error) = update.error {
            self.error = error;
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(timestamp) = update.timestamp {
            self.timestamp = timestamp;
        }
        if let Some(retry_count) = update.retry_count {
            self.retry_count = retry_count;
        }
        if let Some(controller) = update.controller {
            self.controller = controller;
        }
        if let Some(cache_time) = update.cache_time {
            self.cache_time = Some(cache_time);
        }
    }

    pub(crate) fn snapshot(&self) -> QueryState {
        QueryState {
            status: self.status,
            data: self.data.clone(),
            error: self.error.clone(),
            timestamp: self.timestamp,
            retry_count: self.retry_count,
            is_fetching: self.controller.is_some(),
            subscriber_count: self.subscribers.len(),
        }
    }
}

/// Point-in-time copy of an entry, handed to subscribers and readers.
#[derive(Clone)]
pub struct QueryState {
    pub status: QueryStatus,
    pub data: Option<QueryData>,
    pub error: Option<QueryError>,
    pub timestamp: Option<Instant>,
    pub retry_count: u32,
    /// A fetch attempt currently owns the entry.
    pub is_fetching: bool,
    pub subscriber_count: usize,
}

impl QueryState {
    /// Cached data downcast to `T`.
    pub fn data_as<T: Any>(&self) -> Option<&T> {
        self.data.as_deref()?.downcast_ref::<T>()
    }

    /// Time since the last success or error transition.
    pub fn age(&self) -> Option<Duration> {
        self.timestamp.map(|t| t.elapsed())
    }

    /// `now - timestamp > stale_time`. Entries without a timestamp are always stale.
    pub fn is_stale(&self, stale_time: Duration) -> bool {
        self.age().map_or(true, |age| age > stale_time)
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }
}

impl fmt::Debug for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryState")
            .field("status", &self.status)
            .field("has_data", &self.data.is_some())
            .field("error", &self.error)
            .field("timestamp", &self.timestamp)
            .field("retry_count", &self.retry_count)
            .field("is_fetching", &self.is_fetching)
            .field("subscriber_count", &self.subscriber_count)
            .finish()
    }
}

/// Partial update merged into an entry by [`CacheStore::set`](super::CacheStore::set).
///
/// Fields left untouched keep the entry's prior value.
///
/// ```
/// use query_kit::store::{EntryUpdate, QueryStatus};
///
/// let update = EntryUpdate::new()
///     .data(42_u32)
///     .status(QueryStatus::Success)
///     .clear_error();
/// # let _ = update;
/// ```
#[derive(Clone, Default)]
pub struct EntryUpdate {
    data: Option<Option<QueryData>>,
    error: Option<Option<QueryError>>,
    status: Option<QueryStatus>,
    timestamp: Option<Option<Instant>>,
    retry_count: Option<u32>,
    controller: Option<Option<AbortController>>,
    cache_time: Option<Duration>,
}

impl EntryUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data<T: Any + Send + Sync>(self, data: T) -> Self {
        self.shared_data(Arc::new(data))
    }

    pub fn shared_data(mut self, data: QueryData) -> Self {
        self.data = Some(Some(data));
        self
    }

    pub fn clear_data(mut self) -> Self {
        self.data = Some(None);
        self
    }

    pub fn error(mut self, error: QueryError) -> Self {
        self.error = Some(Some(error));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error = Some(None);
        self
    }

    pub fn status(mut self, status: QueryStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// `None` resets the entry to "never updated".
    pub fn timestamp(mut self, timestamp: Option<Instant>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn controller(mut self, controller: AbortController) -> Self {
        self.controller = Some(Some(controller));
        self
    }

    pub fn clear_controller(mut self) -> Self {
        self.controller = Some(None);
        self
    }

    pub fn cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = Some(cache_time);
        self
    }
}
