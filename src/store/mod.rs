//! In-memory query cache store.
//!
//! Maps serialized query keys to entry records. Each entry carries its own subscriber
//! list and at most one garbage-collection timer. Uses DashMap so the store can be shared
//! across tasks and threads; all mutation of one key happens under that key's shard lock, and
//! subscribers are always notified after the lock is released.
//!
//! # Lifecycle
//!
//! - Entries are created lazily by [`set`](CacheStore::set), [`subscribe`](CacheStore::subscribe)
//!   or the first fetch of a key.
//! - [`invalidate`](CacheStore::invalidate) resets status and timestamp but keeps data.
//! - Entries are destroyed by [`remove`](CacheStore::remove), by eviction when the store grows
//!   past [`StoreConfig::max_entries`], or by their GC timer.
//!
//! # Eviction
//!
//! After an insert pushes the store over its cap, the oldest eligible entry (smallest
//! timestamp, then oldest creation) is removed. Eligible means no subscribers, not loading and
//! no fetch in flight. When nothing is eligible the cap is exceeded until something becomes
//! eligible; observed or loading entries are never evicted.

mod entry;

pub(crate) use entry::CacheEntry;
pub use entry::{EntryUpdate, QueryData, QueryState, QueryStatus, SubscriberFn};

use crate::abort::{AbortController, AbortRegistry};
use crate::observability::{NoOpMetrics, QueryMetrics};
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use entry::Subscriber;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Default entry cap.
pub const DEFAULT_MAX_ENTRIES: usize = 100;

/// Default delay before an unobserved entry is garbage-collected.
pub const DEFAULT_CACHE_TIME: Duration = Duration::from_secs(5 * 60);

/// Store-wide settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Entry count above which eviction kicks in.
    pub max_entries: usize,

    /// GC delay for entries whose fetch did not set its own.
    pub cache_time: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            max_entries: DEFAULT_MAX_ENTRIES,
            cache_time: DEFAULT_CACHE_TIME,
        }
    }
}

impl StoreConfig {
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn with_cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = cache_time;
        self
    }
}

/// Diagnostic snapshot returned by [`CacheStore::stats`].
#[derive(Clone, Debug, Serialize)]
pub struct StoreStats {
    pub size: usize,
    /// Sorted by descending age; never-updated entries first.
    pub entries: Vec<EntryStats>,
}

#[derive(Clone, Debug, Serialize)]
pub struct EntryStats {
    pub key: String,
    pub status: QueryStatus,
    /// `None` when the entry was never updated or was invalidated.
    pub age: Option<Duration>,
    pub subscribers: usize,
}

/// Handle returned by [`CacheStore::subscribe`]. Dropping it removes the callback.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    store: Weak<StoreInner>,
    key: String,
    id: u64,
}

impl Subscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Remove the callback now.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.store.upgrade() {
            CacheStore { inner }.unsubscribe(&self.key, self.id);
        }
    }
}

/// Outcome of [`CacheStore::claim_or_join`].
pub(crate) enum FetchSlot {
    /// The caller owns a new attempt and must drive it to completion.
    Owner(AbortController),

    /// An attempt is already in flight; the receiver fires with the state that settled it.
    Joined {
        receiver: oneshot::Receiver<QueryState>,
        subscription: Subscription,
    },
}

struct GcTimer {
    id: u64,
    handle: JoinHandle<()>,
}

struct StoreInner {
    entries: DashMap<String, CacheEntry>,
    gc_timers: DashMap<String, GcTimer>,
    aborts: AbortRegistry,
    config: StoreConfig,
    metrics: Arc<dyn QueryMetrics>,
    next_seq: AtomicU64,
    next_id: AtomicU64,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        for timer in self.gc_timers.iter() {
            timer.handle.abort();
        }
        for entry in self.entries.iter() {
            if let Some(controller) = &entry.controller {
                controller.abort();
                self.aborts.release(entry.key(), controller.id());
            }
        }
    }
}

/// Shared in-memory cache store.
///
/// Cheap to clone; clones share the same entries. Construct one per isolated cache (tests
/// typically build their own).
///
/// # Example
///
/// ```
/// use query_kit::store::{CacheStore, EntryUpdate, QueryStatus};
///
/// let store = CacheStore::new();
/// store.set("k", EntryUpdate::new().data(1_u32).status(QueryStatus::Success));
///
/// let state = store.get("k").expect("entry exists");
/// assert_eq!(state.data_as::<u32>(), Some(&1));
///
/// store.invalidate(None);
/// let state = store.get("k").expect("entry exists");
/// assert_eq!(state.status, QueryStatus::Idle);
/// assert_eq!(state.data_as::<u32>(), Some(&1));
/// ```
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<StoreInner>,
}

impl CacheStore {
    /// Create a store with default settings.
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        Self::with_metrics(config, Arc::new(NoOpMetrics))
    }

    /// Create a store reporting to a custom metrics handler.
    pub fn with_metrics(config: StoreConfig, metrics: Arc<dyn QueryMetrics>) -> Self {
        CacheStore {
            inner: Arc::new(StoreInner {
                entries: DashMap::new(),
                gc_timers: DashMap::new(),
                aborts: AbortRegistry::new(),
                config,
                metrics,
                next_seq: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Registry of controllers for fetches running against this store.
    pub fn aborts(&self) -> &AbortRegistry {
        &self.inner.aborts
    }

    pub(crate) fn metrics(&self) -> &dyn QueryMetrics {
        self.inner.metrics.as_ref()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner
            .entries
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Read-only lookup.
    pub fn get(&self, key: &str) -> Option<QueryState> {
        self.inner.entries.get(key).map(|entry| entry.snapshot())
    }

    /// Merge `update` into the entry for `key`, creating it if needed, then enforce the cap.
    pub fn set(&self, key: &str, update: EntryUpdate) {
        self.entry_mut(key).apply(update);
        self.enforce_capacity();
    }

    /// Register `callback` for notifications on `key`, creating the entry if needed.
    ///
    /// A pending GC timer for the key is cancelled.
    pub fn subscribe<F>(&self, key: &str, callback: F) -> Subscription
    where
        F: Fn(&QueryState) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.entry_mut(key).subscribers.push(Subscriber {
            id,
            callback: Arc::new(callback),
        });
        self.cancel_gc(key);
        self.enforce_capacity();
        self.subscription(key, id)
    }

    /// Synchronously invoke every callback for `key` in registration order.
    ///
    /// A panicking callback is logged and skipped.
    pub fn notify(&self, key: &str) {
        let (state, callbacks) = match self.inner.entries.get(key) {
            Some(entry) => (
                entry.snapshot(),
                entry
                    .subscribers
                    .iter()
                    .map(|subscriber| subscriber.callback.clone())
                    .collect::<Vec<_>>(),
            ),
            None => return,
        };

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&state))).is_err() {
                error!("Subscriber for {} panicked during notification", key);
            }
        }
    }

    /// Reset status to idle and timestamp to "never" for entries whose key equals or starts
    /// with `prefix` (all entries when `None`), notifying each. Data is kept.
    pub fn invalidate(&self, prefix: Option<&str>) -> usize {
        self.invalidate_where(|key| prefix.map_or(true, |p| key.starts_with(p)))
    }

    /// [`invalidate`](Self::invalidate) with an arbitrary key predicate.
    pub fn invalidate_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let mut count = 0;
        for key in self.matching_keys(&predicate) {
            let touched = self
                .modify(&key, |entry| {
                    entry.status = QueryStatus::Idle;
                    entry.timestamp = None;
                })
                .is_some();
            if touched {
                self.notify(&key);
                count += 1;
            }
        }

        debug!("Invalidated {} entries", count);
        count
    }

    /// Delete the entry for `key`, aborting and releasing its in-flight controller.
    pub fn remove(&self, key: &str) -> bool {
        match self.inner.entries.remove(key) {
            Some((key, entry)) => {
                self.dispose(&key, entry);
                debug!("Removed {}", key);
                true
            }
            None => {
                self.cancel_gc(key);
                false
            }
        }
    }

    /// Remove entries whose key equals or starts with `prefix` (all entries when `None`).
    pub fn remove_matching(&self, prefix: Option<&str>) -> usize {
        self.remove_where(|key| prefix.map_or(true, |p| key.starts_with(p)))
    }

    /// [`remove_matching`](Self::remove_matching) with an arbitrary key predicate.
    pub fn remove_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        self.matching_keys(&predicate)
            .iter()
            .filter(|key| self.remove(key))
            .count()
    }

    /// Remove every entry.
    pub fn clear(&self) -> usize {
        let count = self.remove_matching(None);
        if count > 0 {
            warn!("CacheStore CLEAR removed {} entries", count);
        }
        count
    }

    /// (Re)arm the GC timer for `key`.
    ///
    /// When it fires the entry is removed only if it is still eligible at that moment.
    /// Rescheduling replaces the previous timer. Requires a tokio runtime; without one the call
    /// is a no-op.
    pub fn schedule_gc(&self, key: &str, cache_time: Duration) {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                debug!("No tokio runtime, GC timer for {} not scheduled", key);
                return;
            }
        };

        let id = self.next_id();
        let store = Arc::downgrade(&self.inner);
        let owned_key = key.to_string();
        let handle = runtime.spawn(async move {
            tokio::time::sleep(cache_time).await;
            if let Some(inner) = store.upgrade() {
                CacheStore { inner }.collect(&owned_key, id);
            }
        });

        if let Some(previous) = self
            .inner
            .gc_timers
            .insert(key.to_string(), GcTimer { id, handle })
        {
            previous.handle.abort();
        }
    }

    /// Disarm the GC timer for `key`, if any.
    pub fn cancel_gc(&self, key: &str) -> bool {
        match self.inner.gc_timers.remove(key) {
            Some((_, timer)) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Snapshot of every entry, oldest first.
    pub fn stats(&self) -> StoreStats {
        let mut entries: Vec<EntryStats> = self
            .inner
            .entries
            .iter()
            .map(|entry| EntryStats {
                key: entry.key().clone(),
                status: entry.status,
                age: entry.timestamp.map(|t| t.elapsed()),
                subscribers: entry.subscribers.len(),
            })
            .collect();
        entries.sort_by(|a, b| {
            let a_age = a.age.unwrap_or(Duration::MAX);
            let b_age = b.age.unwrap_or(Duration::MAX);
            b_age.cmp(&a_age)
        });

        StoreStats {
            size: entries.len(),
            entries,
        }
    }

    /// Log a one-line summary at debug level.
    pub fn log_stats(&self) {
        let stats = self.stats();
        let loading = stats
            .entries
            .iter()
            .filter(|entry| entry.status == QueryStatus::Loading)
            .count();
        debug!(
            "Query cache: {} entries ({} loading), {} GC timers armed",
            stats.size,
            loading,
            self.inner.gc_timers.len()
        );
    }

    // ------------------------------------------------------------------------
    // Crate-internal operations used by the query client
    // ------------------------------------------------------------------------

    /// Run `f` against an existing entry under its shard lock.
    pub(crate) fn modify<R>(&self, key: &str, f: impl FnOnce(&mut CacheEntry) -> R) -> Option<R> {
        self.inner
            .entries
            .get_mut(key)
            .map(|mut entry| f(entry.value_mut()))
    }

    /// Atomically either start a new attempt for `key` or join the one in flight.
    ///
    /// The owner path sets `status = loading`, installs and registers a fresh controller, and
    /// notifies. The join path subscribes a one-shot listener that fires on the next `success`
    /// or `error`, or on `idle` once no attempt owns the entry any more.
    pub(crate) fn claim_or_join(&self, key: &str, cache_time: Option<Duration>) -> FetchSlot {
        let id = self.next_id();
        let claimed = {
            let mut entry = self.entry_mut(key);
            if entry.status == QueryStatus::Loading && entry.controller.is_some() {
                let (tx, rx) = oneshot::channel();
                let tx = Mutex::new(Some(tx));
                entry.subscribers.push(Subscriber {
                    id,
                    callback: Arc::new(move |state: &QueryState| {
                        let settled = match state.status {
                            QueryStatus::Success | QueryStatus::Error => true,
                            QueryStatus::Idle => !state.is_fetching,
                            QueryStatus::Loading => false,
                        };
                        if settled {
                            if let Some(tx) = tx.lock().take() {
                                let _ = tx.send(state.clone());
                            }
                        }
                    }),
                });
                Err(rx)
            } else {
                let controller = AbortController::new();
                entry.status = QueryStatus::Loading;
                let previous = entry.controller.replace(controller.clone());
                if let Some(cache_time) = cache_time {
                    entry.cache_time = Some(cache_time);
                }
                self.inner.aborts.register(key, controller.clone());
                Ok((controller, previous))
            }
        };

        self.cancel_gc(key);
        match claimed {
            Ok((controller, previous)) => {
                // An invalidated entry may still carry the attempt it superseded.
                if let Some(previous) = previous {
                    debug!("Aborting superseded fetch for {}", key);
                    previous.abort();
                }
                debug!("Starting fetch for {}", key);
                self.enforce_capacity();
                self.notify(key);
                FetchSlot::Owner(controller)
            }
            Err(receiver) => {
                debug!("Joining in-flight fetch for {}", key);
                self.inner.metrics.record_dedup(key);
                FetchSlot::Joined {
                    receiver,
                    subscription: self.subscription(key, id),
                }
            }
        }
    }

    /// Return the entry to `idle` after the attempt with `controller_id` was cancelled.
    ///
    /// Data from earlier successes is kept. Joiners waiting on the attempt observe `idle` with
    /// no fetch in flight and give up. The GC timer cancelled by the claim is re-armed when the
    /// entry is left unobserved.
    pub(crate) fn reset_cancelled(&self, key: &str, controller_id: u64) -> bool {
        let reset = self.modify(key, |entry| {
            if !entry.owned_by(controller_id) {
                return None;
            }
            entry.controller = None;
            if entry.status == QueryStatus::Loading {
                entry.status = QueryStatus::Idle;
            }
            Some(entry.is_eligible())
        });

        let Some(Some(eligible)) = reset else {
            return false;
        };
        debug!("Fetch for {} cancelled, entry reset to idle", key);
        self.notify(key);
        if eligible {
            let cache_time = self.cache_time_for(key);
            self.schedule_gc(key, cache_time);
        }
        true
    }

    /// Apply `update` only if the attempt with `controller_id` still owns the entry, clearing
    /// its controller. Returns whether anything was written.
    pub(crate) fn settle(&self, key: &str, controller_id: u64, update: EntryUpdate) -> bool {
        let written = self
            .modify(key, |entry| {
                if !entry.owned_by(controller_id) {
                    return false;
                }
                entry.apply(update.clear_controller());
                true
            })
            .unwrap_or(false);

        if written {
            self.notify(key);
        }
        written
    }

    /// Delay applied when `key` becomes unobserved.
    pub(crate) fn cache_time_for(&self, key: &str) -> Duration {
        self.modify(key, |entry| entry.cache_time)
            .flatten()
            .unwrap_or(self.inner.config.cache_time)
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn entry_mut(&self, key: &str) -> RefMut<'_, String, CacheEntry> {
        self.inner
            .entries
            .entry(key.to_string())
            .or_insert_with(|| {
                CacheEntry::new(self.inner.next_seq.fetch_add(1, Ordering::Relaxed))
            })
    }

    fn subscription(&self, key: &str, id: u64) -> Subscription {
        Subscription {
            store: Arc::downgrade(&self.inner),
            key: key.to_string(),
            id,
        }
    }

    fn unsubscribe(&self, key: &str, id: u64) {
        // The removed callback is dropped outside the shard lock: it may own a Subscription
        // whose drop re-enters the store.
        let outcome = self.modify(key, |entry| {
            let removed = entry
                .subscribers
                .iter()
                .position(|subscriber| subscriber.id == id)
                .map(|index| entry.subscribers.remove(index));
            (removed, entry.is_eligible())
        });

        if let Some((Some(_removed), true)) = outcome {
            let cache_time = self.cache_time_for(key);
            self.schedule_gc(key, cache_time);
        }
    }

    fn matching_keys<F>(&self, predicate: &F) -> Vec<String>
    where
        F: Fn(&str) -> bool,
    {
        self.inner
            .entries
            .iter()
            .filter(|entry| predicate(entry.key()))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Release everything an entry holds once it has left the map.
    fn dispose(&self, key: &str, entry: CacheEntry) {
        if let Some(controller) = &entry.controller {
            controller.abort();
            self.inner.aborts.release(key, controller.id());
        }
        self.cancel_gc(key);
    }

    /// GC timer callback.
    fn collect(&self, key: &str, timer_id: u64) {
        self.inner
            .gc_timers
            .remove_if(key, |_, timer| timer.id == timer_id);

        if let Some((key, entry)) = self
            .inner
            .entries
            .remove_if(key, |_, entry| entry.is_eligible())
        {
            self.inner.metrics.record_gc(&key);
            debug!("Garbage-collected {}", key);
            self.dispose(&key, entry);
        }
    }

    fn enforce_capacity(&self) {
        let max = self.inner.config.max_entries;
        let mut rounds = 0;

        while self.inner.entries.len() > max {
            let victim = self
                .inner
                .entries
                .iter()
                .filter(|entry| entry.is_eligible())
                .min_by_key(|entry| (entry.timestamp, entry.seq))
                .map(|entry| entry.key().clone());

            let Some(victim) = victim else {
                debug!(
                    "Store over capacity ({} > {}) with no evictable entry",
                    self.inner.entries.len(),
                    max
                );
                return;
            };

            if let Some((key, entry)) = self
                .inner
                .entries
                .remove_if(&victim, |_, entry| entry.is_eligible())
            {
                self.inner.metrics.record_eviction(&key);
                debug!("Evicted {} to stay within {} entries", key, max);
                self.dispose(&key, entry);
            }

            rounds += 1;
            if rounds > max {
                return;
            }
        }
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}
