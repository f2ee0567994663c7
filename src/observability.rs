//! Observability hooks for query and store activity.
//!
//! Implement [`QueryMetrics`] to forward cache behavior to your monitoring system:
//!
//! ```ignore
//! use query_kit::observability::QueryMetrics;
//! use std::time::Duration;
//!
//! struct PrometheusMetrics;
//!
//! impl QueryMetrics for PrometheusMetrics {
//!     fn record_fetch(&self, _key: &str, _duration: Duration, _succeeded: bool) {
//!         // histogram!("query_fetch_latency").record(duration);
//!     }
//!     // ... implement other methods
//! }
//!
//! // let store = CacheStore::with_metrics(StoreConfig::default(), Arc::new(PrometheusMetrics));
//! ```
//!
//! Every method has a default that logs through the `log` crate, so a partial implementation is
//! fine. [`NoOpMetrics`] silences everything.
//!
//! # Hooks
//!
//! - `record_hit()` - fresh cached data served without calling the fetch function
//! - `record_dedup()` - a caller joined an in-flight fetch
//! - `record_fetch()` - a fetch finished (after retries), with its total duration
//! - `record_retry()` - a retryable failure is about to be retried
//! - `record_error()` - a fetch ended in a terminal failure
//! - `record_eviction()` - an entry was evicted to respect the store cap
//! - `record_gc()` - an entry was garbage-collected by its timer

use std::time::Duration;

/// Trait for query metrics collection.
pub trait QueryMetrics: Send + Sync {
    /// Fresh cached data was served.
    fn record_hit(&self, key: &str) {
        debug!("Query HIT: {}", key);
    }

    /// A caller joined an in-flight fetch.
    fn record_dedup(&self, key: &str) {
        debug!("Query DEDUP: {}", key);
    }

    /// A fetch completed.
    fn record_fetch(&self, key: &str, duration: Duration, succeeded: bool) {
        debug!(
            "Query FETCH: {} took {:?} (succeeded: {})",
            key, duration, succeeded
        );
    }

    /// A retry is scheduled after `delay`.
    fn record_retry(&self, key: &str, attempt: u32, delay: Duration) {
        debug!(
            "Query RETRY: {} attempt {} failed, next in {:?}",
            key, attempt, delay
        );
    }

    /// A terminal failure was stored for the key.
    fn record_error(&self, key: &str, error: &str) {
        warn!("Query ERROR for {}: {}", key, error);
    }

    /// An entry was evicted to respect the store cap.
    fn record_eviction(&self, key: &str) {
        debug!("Query EVICT: {}", key);
    }

    /// An entry was garbage-collected.
    fn record_gc(&self, key: &str) {
        debug!("Query GC: {}", key);
    }
}

/// Silent metrics implementation.
#[derive(Clone, Default)]
pub struct NoOpMetrics;

impl QueryMetrics for NoOpMetrics {
    fn record_hit(&self, _key: &str) {}
    fn record_dedup(&self, _key: &str) {}
    fn record_fetch(&self, _key: &str, _duration: Duration, _succeeded: bool) {}
    fn record_retry(&self, _key: &str, _attempt: u32, _delay: Duration) {}
    fn record_error(&self, _key: &str, _error: &str) {}
    fn record_eviction(&self, _key: &str) {}
    fn record_gc(&self, _key: &str) {}
}

/// Metrics implementation that keeps the default logging behavior.
#[derive(Clone, Default)]
pub struct LogMetrics;

impl QueryMetrics for LogMetrics {}
