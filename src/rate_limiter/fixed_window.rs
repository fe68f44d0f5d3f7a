//! Fixed window counter: at most `capacity` permits per `window`, reset
//! wholesale at each window boundary.

use crate::clock::{system_clock, Clock};
use crate::error::{InvalidArgument, RateLimiterError};
use crate::semaphore::engine::{AcquireError, Engine, PermitPool};
use futures::future::BoxFuture;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct FixedWindowPool {
    capacity: u32,
    window: Duration,
    window_start: Instant,
    used: u32,
}

impl PermitPool for FixedWindowPool {
    fn try_acquire(&mut self, permits: u32, _now: Instant) -> bool {
        if self.used + permits <= self.capacity {
            self.used += permits;
            true
        } else {
            false
        }
    }

    fn release(&mut self, _permits: u32) {
        // Spent permits stay spent until the window resets.
    }

    fn tick(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= self.window {
            let window_nanos = self.window.as_nanos().max(1);
            let elapsed_windows = elapsed.as_nanos() / window_nanos;
            self.window_start += self.window * (elapsed_windows as u32);
            self.used = 0;
        }
    }

    fn retry_after(&self, _permits: u32, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.window_start);
        self.window.saturating_sub(elapsed).max(Duration::from_millis(1))
    }
}

/// Fixed window counter rate limiter: admits at most `capacity` permits per
/// `window`, then flatly resets.
pub struct FixedWindowCounter {
    engine: Engine<FixedWindowPool>,
}

impl FixedWindowCounter {
    /// Fails if `capacity` is zero or `window` is zero.
    pub fn new(
        capacity: u32,
        window: Duration,
        max_queue_length: usize,
    ) -> Result<Self, InvalidArgument> {
        Self::with_clock(capacity, window, max_queue_length, system_clock())
    }

    pub(crate) fn with_clock(
        capacity: u32,
        window: Duration,
        max_queue_length: usize,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, InvalidArgument> {
        if capacity == 0 {
            return Err(InvalidArgument::new("capacity must be positive"));
        }
        if window.is_zero() {
            return Err(InvalidArgument::new("window must be positive"));
        }
        let pool = FixedWindowPool {
            capacity,
            window,
            window_start: clock.now(),
            used: 0,
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

impl super::RateLimiter for FixedWindowCounter {
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
