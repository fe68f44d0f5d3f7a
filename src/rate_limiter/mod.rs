//! Rate limiting: fixed window, token bucket, and sliding window counter
//! algorithms sharing the same FIFO-queue-and-timeout engine the semaphore
//! uses, plus a per-key wrapper over any of them.

mod fixed_window;
mod keyed;
mod sliding_window_counter;
mod token_bucket;

pub use fixed_window::FixedWindowCounter;
pub use keyed::KeyedRateLimiter;
pub use sliding_window_counter::SlidingWindowCounter;
pub use token_bucket::TokenBucket;

use crate::error::RateLimiterError;
use futures::future::BoxFuture;
use std::convert::Infallible;
use std::future::Future;
use std::time::Duration;

/// Common surface shared by the three rate limiting algorithms, object-safe
/// so a [`KeyedRateLimiter`] can hold one behind a trait object per key.
pub trait RateLimiter: Send + Sync {
    /// Admits `permits`, suspending up to `timeout` if the limiter can't
    /// admit them immediately. Unlike the semaphore, there is nothing to
    /// release afterwards — a rate limiter spends permits, it doesn't lend
    /// them.
    fn acquire<'a>(
        &'a self,
        permits: u32,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<(), RateLimiterError<Infallible>>>;

    /// Non-blocking probe: admits `permits` right now or fails immediately.
    fn try_acquire(&self, permits: u32) -> Result<(), RateLimiterError<Infallible>>;

    /// Returns `permits` to the underlying pool. A no-op for the algorithms
    /// in this crate, which replenish purely through their own tick logic
    /// rather than lending permits out — present so a pluggable backend that
    /// *does* lend permits has somewhere to return them.
    fn release(&self, permits: u32);

    /// Requests currently queued waiting for admission.
    fn queue_length(&self) -> usize;
}

/// Calls [`RateLimiter::release`] when dropped, even if `operation` panics.
struct ReleaseGuard<'a, R: RateLimiter + ?Sized> {
    limiter: &'a R,
    permits: u32,
}

impl<R: RateLimiter + ?Sized> Drop for ReleaseGuard<'_, R> {
    fn drop(&mut self) {
        self.limiter.release(self.permits);
    }
}

/// Runs `operation` only after `limiter` admits `permits`, translating a
/// rejection into [`RateLimiterError::Rejected`] without ever calling
/// `operation`. `permits` are released whether `operation` succeeds, fails,
/// or panics.
pub async fn call<R, F, Fut, T, E>(
    limiter: &R,
    permits: u32,
    timeout: Duration,
    operation: F,
) -> Result<T, RateLimiterError<E>>
where
    R: RateLimiter + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    match limiter.acquire(permits, timeout).await {
        Ok(()) => {}
        Err(RateLimiterError::Rejected { retry_after }) => {
            return Err(RateLimiterError::Rejected { retry_after })
        }
        Err(RateLimiterError::InvalidArgument(e)) => return Err(RateLimiterError::InvalidArgument(e)),
        Err(RateLimiterError::Operation(infallible)) => match infallible {},
    }
    let _guard = ReleaseGuard { limiter, permits };
    operation().await.map_err(RateLimiterError::Operation)
}
