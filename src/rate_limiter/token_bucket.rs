//! Token bucket: a pool of tokens refilled at a steady rate, capped at a
//! maximum burst size.

use crate::clock::{system_clock, Clock};
use crate::error::{InvalidArgument, RateLimiterError};
use crate::semaphore::engine::{AcquireError, Engine, PermitPool};
use futures::future::BoxFuture;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct TokenBucketPool {
    capacity: u32,
    tokens: u32,
    tokens_per_refill: u32,
    refill_interval: Duration,
    last_refill: Instant,
}

impl PermitPool for TokenBucketPool {
    fn try_acquire(&mut self, permits: u32, _now: Instant) -> bool {
        if self.tokens >= permits {
            self.tokens -= permits;
            true
        } else {
            false
        }
    }

    fn release(&mut self, _permits: u32) {
        // Consumed tokens only come back through scheduled refills.
    }

    fn tick(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let interval_nanos = self.refill_interval.as_nanos().max(1);
        let periods = elapsed.as_nanos() / interval_nanos;
        if periods > 0 {
            let periods = periods as u64;
            let minted = periods.saturating_mul(self.tokens_per_refill as u64);
            self.tokens = (self.tokens as u64 + minted).min(self.capacity as u64) as u32;
            self.last_refill += self.refill_interval * (periods as u32);
        }
    }

    fn retry_after(&self, permits: u32, now: Instant) -> Duration {
        if self.tokens >= permits {
            return Duration::from_millis(1);
        }
        let deficit = permits - self.tokens;
        let periods_needed =
            (deficit as u64).div_ceil(self.tokens_per_refill.max(1) as u64);
        let elapsed_into_period = now.saturating_duration_since(self.last_refill);
        let total_wait = self.refill_interval * (periods_needed as u32);
        total_wait
            .saturating_sub(elapsed_into_period)
            .max(Duration::from_millis(1))
    }
}

/// Token bucket rate limiter: up to `capacity` tokens may be spent in a
/// burst; `tokens_per_refill` tokens are minted every `refill_interval`.
pub struct TokenBucket {
    engine: Engine<TokenBucketPool>,
}

impl TokenBucket {
    /// Fails if `capacity`, `tokens_per_refill`, or `refill_interval` is
    /// zero.
    pub fn new(
        capacity: u32,
        tokens_per_refill: u32,
        refill_interval: Duration,
        max_queue_length: usize,
    ) -> Result<Self, InvalidArgument> {
        Self::with_clock(
            capacity,
            tokens_per_refill,
            refill_interval,
            max_queue_length,
            system_clock(),
        )
    }

    pub(crate) fn with_clock(
        capacity: u32,
        tokens_per_refill: u32,
        refill_interval: Duration,
        max_queue_length: usize,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, InvalidArgument> {
        if capacity == 0 {
            return Err(InvalidArgument::new("capacity must be positive"));
        }
        if tokens_per_refill == 0 {
            return Err(InvalidArgument::new("tokens_per_refill must be positive"));
        }
        if refill_interval.is_zero() {
            return Err(InvalidArgument::new("refill_interval must be positive"));
        }
        let pool = TokenBucketPool {
            capacity,
            tokens: capacity,
            tokens_per_refill,
            refill_interval,
            last_refill: clock.now(),
        };
        Ok(Self {
            engine: Engine::new(pool, max_queue_length, clock),
        })
    }

    async fn acquire_inner(
        &self,
        permits: u32,
        timeout: Duration,
    ) -> Result<(), RateLimiterError<Infallible>> {
        self.engine
            .acquire(permits, timeout)
            .await
            .map_err(|e: AcquireError| RateLimiterError::Rejected {
                retry_after: e.retry_after(),
            })
    }
}

impl super::RateLimiter for TokenBucket {
    fn acquire<'a>(
        &'a self,
        permits: u32,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<(), RateLimiterError<Infallible>>> {
        Box::pin(self.acquire_inner(permits, timeout))
    }

    fn try_acquire(&self, permits: u32) -> Result<(), RateLimiterError<Infallible>> {
        futures::executor::block_on(self.acquire_inner(permits, Duration::ZERO))
    }

    fn release(&self, permits: u32) {
        self.engine.release(permits);
    }

    fn queue_length(&self) -> usize {
        self.engine.queued_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::rate_limiter::RateLimiter as _;

    #[tokio::test]
    async fn starts_full_and_drains() {
        let limiter = TokenBucket::new(3, 1, Duration::from_secs(1), 0).unwrap();
        limiter.acquire(3, Duration::ZERO).await.unwrap();
        let err = limiter.acquire(1, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, RateLimiterError::Rejected { .. }));
    }

    #[tokio::test]
    async fn refills_over_time() {
        let clock = FakeClock::new();
        let limiter =
            TokenBucket::with_clock(2, 1, Duration::from_millis(100), 0, clock.clone()).unwrap();
        limiter.acquire(2, Duration::ZERO).await.unwrap();
        assert!(limiter.acquire(1, Duration::ZERO).await.is_err());
        clock.advance(Duration::from_millis(250));
        // Two refill periods elapsed: 2 tokens minted, capped at capacity.
        limiter.acquire(2, Duration::ZERO).await.unwrap();
    }

    #[test]
    fn rejects_bad_construction() {
        assert!(TokenBucket::new(0, 1, Duration::from_secs(1), 0).is_err());
        assert!(TokenBucket::new(1, 0, Duration::from_secs(1), 0).is_err());
        assert!(TokenBucket::new(1, 1, Duration::ZERO, 0).is_err());
    }
}
