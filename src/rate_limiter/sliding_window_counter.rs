//! Sliding window counter: the window is divided into fixed-size segments;
//! the oldest segment ages out and its count is subtracted as each new
//! segment rotates in, giving smoother behavior than a fixed window without
//! the bookkeeping cost of a true per-request sliding log.

use crate::clock::{system_clock, Clock};
use crate::error::{InvalidArgument, RateLimiterError};
use crate::ring_buffer::RingBuffer;
use crate::semaphore::engine::{AcquireError, Engine, PermitPool};
use futures::future::BoxFuture;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct SlidingWindowCounterPool {
    capacity: u32,
    segments: RingBuffer<u32>,
    segment_period: Duration,
    last_rotation: Instant,
    total_in_use: u32,
}

impl SlidingWindowCounterPool {
    fn rotate_if_needed(&mut self, now: Instant) {
        let segment_count = self.segments.capacity();
        let mut iterations = 0usize;
        while now.saturating_duration_since(self.last_rotation) >= self.segment_period
            && iterations <= segment_count
        {
            if self.segments.is_full() {
                if let Some(&oldest) = self.segments.eldest_entry() {
                    self.total_in_use = self.total_in_use.saturating_sub(oldest);
                }
            }
            self.segments.add(0);
            self.last_rotation += self.segment_period;
            iterations += 1;
        }
        if iterations > segment_count {
            // Idle long enough that every segment aged out; fast-forward
            // instead of looping once per elapsed segment.
            self.segments.clear();
            self.segments.add(0);
            self.total_in_use = 0;
            self.last_rotation = now;
        }
    }
}

impl PermitPool for SlidingWindowCounterPool {
    fn try_acquire(&mut self, permits: u32, _now: Instant) -> bool {
        if self.total_in_use + permits > self.capacity {
            return false;
        }
        self.total_in_use += permits;
        if let Some(index) = self.segments.last_written_index() {
            let current = *self.segments.get(index).unwrap_or(&0);
            let _ = self.segments.set(index, current + permits);
        }
        true
    }

    fn release(&mut self, _permits: u32) {
        // Admitted permits age out with their segment, not on release.
    }

    fn tick(&mut self, now: Instant) {
        self.rotate_if_needed(now);
    }

    fn retry_after(&self, _permits: u32, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.last_rotation);
        self.segment_period
            .saturating_sub(elapsed)
            .max(Duration::from_millis(1))
    }
}

/// Sliding window counter rate limiter: at most `capacity` permits across a
/// `window` split into `segments` equal slices.
pub struct SlidingWindowCounter {
    engine: Engine<SlidingWindowCounterPool>,
}

impl SlidingWindowCounter {
    /// Fails if `capacity` or `segments` is zero, or `window` is zero.
    pub fn new(
        capacity: u32,
        window: Duration,
        segments: usize,
        max_queue_length: usize,
    ) -> Result<Self, InvalidArgument> {
        Self::with_clock(capacity, window, segments, max_queue_length, system_clock())
    }

    pub(crate) fn with_clock(
        capacity: u32,
        window: Duration,
        segments: usize,
        max_queue_length: usize,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, InvalidArgument> {
        if capacity == 0 {
            return Err(InvalidArgument::new("capacity must be positive"));
        }
        if segments == 0 {
            return Err(InvalidArgument::new("segments must be positive"));
        }
        if window.is_zero() {
            return Err(InvalidArgument::new("window must be positive"));
        }
        let segment_period = window / segments as u32;
        if segment_period.is_zero() {
            return Err(InvalidArgument::new(
                "window must be long enough to divide into non-zero segments",
            ));
        }
        let mut ring = RingBuffer::new(segments)?;
        ring.add(0);
        let pool = SlidingWindowCounterPool {
            capacity,
            segments: ring,
            segment_period,
            last_rotation: clock.now(),
            total_in_use: 0,
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

impl super::RateLimiter for SlidingWindowCounter {
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
    async fn admits_up_to_capacity_across_segments() {
        let limiter =
            SlidingWindowCounter::new(3, Duration::from_millis(300), 3, 0).unwrap();
        limiter.acquire(1, Duration::ZERO).await.unwrap();
        limiter.acquire(1, Duration::ZERO).await.unwrap();
        limiter.acquire(1, Duration::ZERO).await.unwrap();
        assert!(limiter.acquire(1, Duration::ZERO).await.is_err());
    }

    #[tokio::test]
    async fn oldest_segment_ages_out_and_frees_capacity() {
        let clock = FakeClock::new();
        let limiter =
            SlidingWindowCounter::with_clock(2, Duration::from_millis(200), 2, 0, clock.clone())
                .unwrap();
        limiter.acquire(2, Duration::ZERO).await.unwrap();
        assert!(limiter.acquire(1, Duration::ZERO).await.is_err());
        // Advance past two full segments: both age out.
        clock.advance(Duration::from_millis(250));
        limiter.acquire(2, Duration::ZERO).await.unwrap();
    }

    #[test]
    fn rejects_bad_construction() {
        assert!(SlidingWindowCounter::new(0, Duration::from_secs(1), 4, 0).is_err());
        assert!(SlidingWindowCounter::new(1, Duration::from_secs(1), 0, 0).is_err());
        assert!(SlidingWindowCounter::new(1, Duration::ZERO, 4, 0).is_err());
    }
}
