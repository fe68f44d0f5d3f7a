//! Error taxonomy for the resilience primitives.
//!
//! Each mechanism exposes its own error enum so that callers only have to
//! match variants that are actually reachable from the method they called,
//! rather than a single crate-wide catch-all.

use std::time::Duration;
use thiserror::Error;

/// Raised when a configuration value fails validation before first use.
///
/// Construction errors are returned from fallible builders; nothing in this
/// crate panics on bad configuration.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("invalid argument: {0}")]
pub struct InvalidArgument(pub String);

impl InvalidArgument {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Failure modes of [`crate::semaphore::SuspendableSemaphore::acquire`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SemaphoreError {
    /// The wait queue was already at its configured maximum length when the
    /// request arrived.
    #[error("acquire rejected: wait queue is full")]
    Rejected,
    /// The caller's timeout elapsed while the request was queued.
    #[error("acquire timed out after {0:?}")]
    Timeout(Duration),
    /// `permits` was non-positive or `timeout` was negative.
    #[error(transparent)]
    InvalidArgument(#[from] InvalidArgument),
}

/// Errors surfaced by [`crate::rate_limiter::RateLimiter::call`] and friends.
#[derive(Debug, Error)]
pub enum RateLimiterError<E> {
    /// The request could not be admitted: either the wait queue was full at
    /// entry, or the caller's timeout elapsed while queued.
    #[error("rate limited, retry after {retry_after:?}")]
    Rejected {
        /// Hint for when the caller should retry.
        retry_after: Duration,
    },
    /// Configuration was invalid.
    #[error(transparent)]
    InvalidArgument(#[from] InvalidArgument),
    /// The wrapped operation itself failed; the permit was still released.
    #[error("operation failed")]
    Operation(#[source] E),
}

impl<E> RateLimiterError<E> {
    pub(crate) fn from_semaphore(err: SemaphoreError, retry_after: Duration) -> Self {
        match err {
            SemaphoreError::Rejected | SemaphoreError::Timeout(_) => {
                Self::Rejected { retry_after }
            }
            SemaphoreError::InvalidArgument(e) => Self::InvalidArgument(e),
        }
    }
}

/// Errors surfaced by [`crate::circuit_breaker::CircuitBreaker::execute_operation`].
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// The breaker is Open, or Half-Open and its trial-call quota is
    /// already spoken for. Does not feed the sliding window.
    #[error("call not permitted: circuit breaker is open")]
    CallNotPermitted,
    /// The wrapped operation returned or threw an error that was not
    /// suppressed by `record_exception_predicate`.
    #[error("operation failed")]
    Operation(#[source] E),
}

/// Errors surfaced by [`crate::retry::RetryExecutor::execute`].
///
/// Generic over the operation's success type `T` and error type `E`, since
/// retry exhaustion may be driven by either an unacceptable result or a
/// retryable error.
#[derive(Debug, Error)]
pub enum RetryError<T, E> {
    /// All attempts were exhausted while the operation kept returning an
    /// error that matched `retry_on_exception`.
    #[error("max retries exceeded after {attempts} attempt(s)")]
    MaxRetriesExceededWithError {
        /// Number of attempts actually made.
        attempts: u32,
        /// The error from the final attempt.
        #[source]
        last_error: E,
    },
    /// All attempts were exhausted while the operation kept returning a
    /// result that matched `retry_on_result` (no exception involved).
    #[error("max retries exceeded after {attempts} attempt(s), last result rejected")]
    MaxRetriesExceededWithResult {
        /// Number of attempts actually made.
        attempts: u32,
        /// The last observed (retry-worthy) result.
        last_result: T,
    },
    /// The operation failed with an error `retry_on_exception` says not to
    /// retry; surfaced immediately without spending further attempts.
    #[error("attempt {attempt} failed with a non-retryable error")]
    NonRetryableError {
        /// The attempt number (1-based) that produced this error.
        attempt: u32,
        #[source]
        error: E,
    },
}

/// Crate-wide error composing the narrower per-mechanism errors.
///
/// Each mechanism's own methods return their narrower `Result` (e.g.
/// `Result<T, SemaphoreError>`) since that's usually all a caller working
/// with a single mechanism needs to match on. This type exists for callers
/// that propagate errors from several mechanisms through one `?`-friendly
/// return type. `RetryError` is deliberately not folded in here: it is
/// generic over both the operation's success and error type, which doesn't
/// compose cleanly into an enum parameterized only on `E`. Callers mixing
/// retry with other mechanisms can map it into this type's `Operation`-style
/// variants explicitly.
#[derive(Debug, Error)]
pub enum ResilienceError<E> {
    #[error(transparent)]
    Semaphore(#[from] SemaphoreError),
    #[error(transparent)]
    RateLimiter(#[from] RateLimiterError<E>),
    #[error(transparent)]
    CircuitBreaker(#[from] CircuitBreakerError<E>),
    #[error(transparent)]
    InvalidArgument(#[from] InvalidArgument),
}
