//! Retry delay policies and failure classification.
//!
//! The retry loop in [`QueryClient::fetch`](crate::QueryClient::fetch) consults two things after
//! a failed attempt:
//!
//! - a [`RetryPredicate`] (or [`FetchError::is_retryable`] when none is set) to decide whether
//!   the failure is transient, and
//! - a [`RetryDelay`] to decide how long to wait before the next attempt.
//!
//! ```
//! use query_kit::retry::{exponential_backoff, RetryDelay};
//! use std::time::Duration;
//!
//! assert_eq!(exponential_backoff(1), Duration::from_millis(1000));
//! assert_eq!(exponential_backoff(3), Duration::from_millis(4000));
//! assert_eq!(exponential_backoff(10), Duration::from_millis(10_000));
//!
//! let fixed = RetryDelay::Fixed(Duration::from_millis(250));
//! assert_eq!(fixed.delay(5), Duration::from_millis(250));
//! ```

use crate::error::FetchError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Delay before the second attempt.
pub const BASE_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Upper bound for any computed backoff delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_millis(10_000);

/// Caller-supplied override of the default retryability heuristics.
pub type RetryPredicate = Arc<dyn Fn(&FetchError) -> bool + Send + Sync>;

/// `min(1000 * 2^(attempt-1), 10000)` milliseconds. Attempt numbers start at 1.
pub fn exponential_backoff(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let factor = 2_u64.checked_pow(exponent).unwrap_or(u64::MAX);
    let millis = (BASE_RETRY_DELAY.as_millis() as u64).saturating_mul(factor);
    Duration::from_millis(millis).min(MAX_RETRY_DELAY)
}

/// How long to wait after a failed attempt.
#[derive(Clone, Default)]
pub enum RetryDelay {
    /// [`exponential_backoff`].
    #[default]
    Exponential,

    /// The same delay after every attempt.
    Fixed(Duration),

    /// Custom function of the attempt number that just failed.
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl RetryDelay {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        RetryDelay::Custom(Arc::new(f))
    }

    /// Delay after `attempt` failed.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            RetryDelay::Exponential => exponential_backoff(attempt),
            RetryDelay::Fixed(d) => *d,
            RetryDelay::Custom(f) => f(attempt),
        }
    }
}

impl fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryDelay::Exponential => write!(f, "Exponential"),
            RetryDelay::Fixed(d) => write!(f, "Fixed({:?})", d),
            RetryDelay::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Decide whether `error` should be retried, honoring an optional override.
pub fn should_retry(error: &FetchError, predicate: Option<&RetryPredicate>) -> bool {
    if error.is_aborted() {
        return false;
    }
    match predicate {
        Some(predicate) => predicate(error),
        None => error.is_retryable(),
    }
}
