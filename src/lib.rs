//! # query-kit
//!
//! An in-process async query cache for Rust.
//!
//! ## Features
//!
//! - **Deduplication:** Concurrent fetches of the same key share one call of the fetch function
//! - **Retry with Backoff:** Transient failures are retried with capped exponential backoff
//! - **Cancellation:** Every attempt owns an abort handle reachable through a shared registry
//! - **Garbage Collection:** Unobserved entries are dropped after their cache time; a size cap
//!   evicts the oldest idle entries
//! - **Subscriptions:** Per-key callbacks fire synchronously on every state transition
//! - **Mutations:** One-shot side-effecting calls with cancel-previous semantics
//!
//! ## Quick Start
//!
//! ```no_run
//! use query_kit::{query_key, FetchError, QueryClient, QueryOptions};
//!
//! # #[tokio::main]
//! # async fn main() -> query_kit::Result<()> {
//! // 1. Create a client (cheap to clone, share it across tasks)
//! let client = QueryClient::new();
//!
//! // 2. Describe the resource
//! let key = query_key!["repo", "r1"];
//!
//! // 3. Fetch it; concurrent callers for the same key join this call
//! let stars: u32 = client
//!     .query(
//!         &key,
//!         |signal| async move {
//!             // Watch `signal` to stop early when the fetch is cancelled.
//!             let _ = signal;
//!             Ok::<_, FetchError>(42)
//!         },
//!         &QueryOptions::default(),
//!     )
//!     .await?;
//!
//! // 4. Mark it stale after a write
//! client.invalidate_queries(Some(&query_key!["repo"]));
//! # let _ = stars;
//! # Ok(())
//! # }
//! ```
//!
//! ## Logging
//!
//! The crate logs through the `log` facade and never installs a logger. Enable `debug` for
//! `query_kit` to trace claims, joins, retries, GC and eviction.

#[macro_use]
extern crate log;

pub mod abort;
pub mod client;
pub mod error;
pub mod key;
pub mod mutation;
pub mod observability;
pub mod retry;
pub mod store;

// Re-exports for convenience
pub use abort::{AbortController, AbortRegistry, AbortSignal};
pub use client::{QueryClient, QueryOptions};
pub use error::{FetchError, FetchErrorKind, QueryError, Result};
pub use key::{serialize_key, QueryKey};
pub use mutation::{MutationOptions, MutationRunner, MutationState};
pub use observability::{NoOpMetrics, QueryMetrics};
pub use retry::RetryDelay;
pub use store::{CacheStore, QueryState, QueryStatus, StoreConfig, Subscription};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
