//! Error types for queries and mutations.
//!
//! Two layers exist:
//!
//! - [`FetchError`] is what a user-supplied fetch or mutation function fails with. It carries
//!   enough transport detail (kind, status code, explicit retryable flag) for the retry loop to
//!   classify it.
//! - [`QueryError`] is what crosses the public boundary of [`QueryClient`](crate::QueryClient)
//!   and [`MutationRunner`](crate::MutationRunner). Cancellation is its own variant so callers
//!   can pattern-match it instead of inspecting messages.

use std::fmt;

/// Result type for query and mutation operations.
pub type Result<T> = std::result::Result<T, QueryError>;

/// Broad category of a fetch failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// Connection refused, reset, DNS failure, etc.
    Network,

    /// The request did not complete in time.
    Timeout,

    /// The remote side answered with a status code (see [`FetchError::status_code`]).
    Status,

    /// The operation observed its abort signal and stopped.
    Aborted,

    /// Anything else. Normalized foreign failures land here.
    Other,
}

/// Failure produced by a fetch or mutation function.
///
/// # Example
///
/// ```
/// use query_kit::FetchError;
///
/// let err = FetchError::status(503, "service unavailable");
/// assert!(err.is_retryable());
///
/// let err = FetchError::status(404, "not found");
/// assert!(!err.is_retryable());
///
/// let err = FetchError::new("quota exceeded").with_retryable(true);
/// assert!(err.is_retryable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchError {
    kind: FetchErrorKind,
    message: String,
    status: Option<u16>,
    retryable: Option<bool>,
}

impl FetchError {
    /// Unclassified failure. Terminal unless marked retryable.
    pub fn new(message: impl Into<String>) -> Self {
        FetchError {
            kind: FetchErrorKind::Other,
            message: message.into(),
            status: None,
            retryable: None,
        }
    }

    /// Transport-level failure. Retryable by default.
    pub fn network(message: impl Into<String>) -> Self {
        FetchError {
            kind: FetchErrorKind::Network,
            ..FetchError::new(message)
        }
    }

    /// Timed-out request. Retryable by default.
    pub fn timeout(message: impl Into<String>) -> Self {
        FetchError {
            kind: FetchErrorKind::Timeout,
            ..FetchError::new(message)
        }
    }

    /// Failure carrying a transport status code.
    pub fn status(code: u16, message: impl Into<String>) -> Self {
        FetchError {
            kind: FetchErrorKind::Status,
            status: Some(code),
            ..FetchError::new(message)
        }
    }

    /// The function stopped because its abort signal fired.
    pub fn aborted() -> Self {
        FetchError {
            kind: FetchErrorKind::Aborted,
            ..FetchError::new("operation aborted")
        }
    }

    /// Declare retryability explicitly, overriding the status-code heuristics.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    pub fn kind(&self) -> FetchErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status_code(&self) -> Option<u16> {
        self.status
    }

    pub fn is_aborted(&self) -> bool {
        self.kind == FetchErrorKind::Aborted
    }

    /// Whether the retry loop may try again after this failure.
    ///
    /// An explicit flag set with [`with_retryable`](Self::with_retryable) wins. Otherwise
    /// network errors, timeouts, 5xx, 408 (request timeout) and 429 (too many requests) are
    /// retryable; other status codes, aborts and unclassified failures are not.
    pub fn is_retryable(&self) -> bool {
        if let Some(retryable) = self.retryable {
            return retryable;
        }

        match self.kind {
            FetchErrorKind::Network | FetchErrorKind::Timeout => true,
            FetchErrorKind::Status => matches!(self.status, Some(408 | 429 | 500..=599)),
            FetchErrorKind::Aborted | FetchErrorKind::Other => false,
        }
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind, self.status) {
            (FetchErrorKind::Status, Some(code)) => write!(f, "HTTP {}: {}", code, self.message),
            (FetchErrorKind::Network, _) => write!(f, "Network error: {}", self.message),
            (FetchErrorKind::Timeout, _) => write!(f, "Timeout: {}", self.message),
            _ => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for FetchError {}

/// Failure surfaced by [`QueryClient`](crate::QueryClient) and
/// [`MutationRunner`](crate::MutationRunner).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// The owner of the operation cancelled it.
    ///
    /// Never retried and never written to the cache as an error.
    Cancelled,

    /// Cancellation observed while waiting out a retry delay.
    CancelledDuringRetry {
        /// The attempt that had just failed when the wait began.
        attempt: u32,
    },

    /// Terminal failure of the fetch or mutation function, after retries.
    Fetch(FetchError),

    /// Cached data for the key holds a different type than the caller asked for.
    TypeMismatch {
        key: String,
        expected: &'static str,
    },
}

impl QueryError {
    /// The single cancellation predicate shared by queries and mutations.
    pub fn is_cancellation(&self) -> bool {
        match self {
            QueryError::Cancelled | QueryError::CancelledDuringRetry { .. } => true,
            QueryError::Fetch(err) => err.is_aborted(),
            QueryError::TypeMismatch { .. } => false,
        }
    }

    /// The underlying fetch failure, if any.
    pub fn as_fetch_error(&self) -> Option<&FetchError> {
        match self {
            QueryError::Fetch(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryError::Cancelled => write!(f, "Operation cancelled"),
            QueryError::CancelledDuringRetry { attempt } => {
                write!(f, "Operation cancelled during retry after attempt {}", attempt)
            }
            QueryError::Fetch(err) => write!(f, "Fetch failed: {}", err),
            QueryError::TypeMismatch { key, expected } => {
                write!(f, "Cached data for {} is not a {}", key, expected)
            }
        }
    }
}

impl std::error::Error for QueryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            QueryError::Fetch(err) => Some(err),
            _ => None,
        }
    }
}

impl From<FetchError> for QueryError {
    fn from(e: FetchError) -> Self {
        if e.is_aborted() {
            QueryError::Cancelled
        } else {
            QueryError::Fetch(e)
        }
    }
}

// ============================================================================
// Normalization of foreign failures
// ============================================================================

impl From<String> for FetchError {
    fn from(e: String) -> Self {
        FetchError::new(e)
    }
}

impl From<&str> for FetchError {
    fn from(e: &str) -> Self {
        FetchError::new(e)
    }
}

impl From<std::io::Error> for FetchError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::TimedOut {
            FetchError::timeout(e.to_string())
        } else {
            FetchError::network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            FetchError::network(e.to_string())
        } else {
            FetchError::new(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(FetchError::status(500, "boom").is_retryable());
        assert!(FetchError::status(503, "busy").is_retryable());
        assert!(FetchError::status(408, "slow").is_retryable());
        assert!(FetchError::status(429, "slow down").is_retryable());
        assert!(!FetchError::status(400, "bad").is_retryable());
        assert!(!FetchError::status(404, "missing").is_retryable());
    }

    #[test]
    fn test_kind_classification() {
        assert!(FetchError::network("reset").is_retryable());
        assert!(FetchError::timeout("deadline").is_retryable());
        assert!(!FetchError::aborted().is_retryable());
        assert!(!FetchError::new("odd").is_retryable());
    }

    #[test]
    fn test_explicit_retryable_wins() {
        assert!(!FetchError::status(500, "boom")
            .with_retryable(false)
            .is_retryable());
        assert!(FetchError::status(400, "bad")
            .with_retryable(true)
            .is_retryable());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            FetchError::status(500, "boom").to_string(),
            "HTTP 500: boom"
        );
        assert_eq!(
            QueryError::Fetch(FetchError::new("Test")).to_string(),
            "Fetch failed: Test"
        );
        assert_eq!(QueryError::Cancelled.to_string(), "Operation cancelled");
    }

    #[test]
    fn test_aborted_fetch_error_becomes_cancellation() {
        let err: QueryError = FetchError::aborted().into();
        assert_eq!(err, QueryError::Cancelled);
        assert!(err.is_cancellation());
        assert!(QueryError::CancelledDuringRetry { attempt: 2 }.is_cancellation());
        assert!(!QueryError::Fetch(FetchError::new("x")).is_cancellation());
    }

    #[test]
    fn test_error_from_string() {
        let err: FetchError = "test error".into();
        assert_eq!(err.kind(), FetchErrorKind::Other);
        assert_eq!(err.message(), "test error");
    }

    #[test]
    fn test_error_from_io() {
        let err: FetchError =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        assert_eq!(err.kind(), FetchErrorKind::Network);
        assert!(err.is_retryable());

        let err: FetchError = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert_eq!(err.kind(), FetchErrorKind::Timeout);
    }
}
