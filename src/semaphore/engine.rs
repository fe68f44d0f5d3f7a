//! Shared FIFO-queue-and-timeout machinery behind the bare semaphore and
//! the three rate limiter algorithms.
//!
//! Each of those four public types differs only in how it decides whether a
//! request can be admitted right now and when to re-check ([`PermitPool`]);
//! the queueing, timeout racing, and fairness rules live here once.

use crate::clock::Clock;
use crate::semaphore::queue::{Handle, WaitQueue};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// A backend that decides whether a request for `permits` can be admitted
/// right now, and if not, when it would be worth checking again.
///
/// Implementors are driven exclusively through `&mut self` by an `Engine`
/// holding them behind a single mutex, so no internal synchronization is
/// required here even for backends whose public wrapper exposes a
/// thread-safe, shareable API.
pub(crate) trait PermitPool: Send {
    /// Attempts to admit `permits`. On success, the permits are considered
    /// in use until a matching `release`.
    fn try_acquire(&mut self, permits: u32, now: Instant) -> bool;

    /// Returns `permits` to the pool. Algorithms that replenish purely on a
    /// timer (fixed window, token bucket) may treat this as a no-op.
    fn release(&mut self, permits: u32);

    /// Advances any time-driven internal state (window resets, token
    /// refills, segment rotation) as of `now`. Called before every
    /// `try_acquire` and at each queue re-check.
    fn tick(&mut self, now: Instant) {
        let _ = now;
    }

    /// Best-effort estimate of how long a caller should wait before trying
    /// again, used both as the `retry_after` surfaced to rejected callers
    /// and as the queue's own re-check interval.
    fn retry_after(&self, permits: u32, now: Instant) -> Duration;
}

struct Waiter {
    permits: u32,
    sender: oneshot::Sender<()>,
}

struct EngineState<P> {
    pool: P,
    queue: WaitQueue<Waiter>,
}

/// Outcome of a failed `Engine::acquire`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AcquireError {
    /// Never entered the queue: it was already at its configured maximum
    /// length, or the caller asked for a non-blocking (`timeout == 0`)
    /// probe that could not be satisfied immediately.
    Rejected { retry_after: Duration },
    /// Sat in the queue without being granted before the caller's timeout
    /// elapsed.
    TimedOut { retry_after: Duration },
}

impl AcquireError {
    pub(crate) fn retry_after(self) -> Duration {
        match self {
            Self::Rejected { retry_after } | Self::TimedOut { retry_after } => retry_after,
        }
    }
}

/// The smallest interval the engine will wait before re-checking a queued
/// request, regardless of what a `PermitPool` reports. Keeps a pool whose
/// `retry_after` briefly returns zero from turning into a busy loop.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

pub(crate) struct Engine<P: PermitPool> {
    state: Mutex<EngineState<P>>,
    max_queue_length: usize,
    clock: Arc<dyn Clock>,
}

impl<P: PermitPool> Engine<P> {
    pub fn new(pool: P, max_queue_length: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(EngineState {
                pool,
                queue: WaitQueue::new(),
            }),
            max_queue_length,
            clock,
        }
    }

    pub fn queued_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn with_pool<R>(&self, f: impl FnOnce(&P) -> R) -> R {
        f(&self.state.lock().pool)
    }

    /// Returns `permits` to the pool and grants them to queued waiters, in
    /// FIFO order, as far as the pool allows.
    pub fn release(&self, permits: u32) {
        let mut state = self.state.lock();
        state.pool.release(permits);
        let now = self.clock.now();
        drain_queue(&mut state.pool, &mut state.queue, now);
    }

    /// Attempts to admit `permits`, waiting up to `timeout` in FIFO order if
    /// the pool can't grant immediately.
    pub async fn acquire(&self, permits: u32, timeout: Duration) -> Result<(), AcquireError> {
        let start = self.clock.now();
        let (handle, mut receiver) = {
            let mut state = self.state.lock();
            let now = self.clock.now();
            state.pool.tick(now);
            if state.queue.is_empty() && state.pool.try_acquire(permits, now) {
                return Ok(());
            }
            if timeout.is_zero() {
                let retry_after = state.pool.retry_after(permits, now);
                tracing::debug!(permits, ?retry_after, "non-blocking probe rejected");
                return Err(AcquireError::Rejected { retry_after });
            }
            if state.queue.len() >= self.max_queue_length {
                let retry_after = state.pool.retry_after(permits, now);
                tracing::warn!(permits, ?retry_after, "rejected: wait queue is full");
                return Err(AcquireError::Rejected { retry_after });
            }
            let (sender, receiver) = oneshot::channel();
            let handle = state.queue.push_back(Waiter { permits, sender });
            (handle, receiver)
        };

        let deadline = start + timeout;
        loop {
            let now = self.clock.now();
            if now >= deadline {
                return self.cancel_wait(handle, &mut receiver, permits).await;
            }
            let remaining = deadline - now;
            let poll_in = {
                let state = self.state.lock();
                state
                    .pool
                    .retry_after(permits, now)
                    .max(MIN_POLL_INTERVAL)
                    .min(remaining)
            };
            match tokio::time::timeout(poll_in, &mut receiver).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(_)) => {
                    // Sender dropped without sending: the engine itself is
                    // gone. Nothing left to wait on.
                    return Err(AcquireError::TimedOut {
                        retry_after: Duration::ZERO,
                    });
                }
                Err(_elapsed) => {
                    let mut state = self.state.lock();
                    let now = self.clock.now();
                    state.pool.tick(now);
                    drain_queue(&mut state.pool, &mut state.queue, now);
                }
            }
        }
    }

    async fn cancel_wait(
        &self,
        handle: Handle,
        receiver: &mut oneshot::Receiver<()>,
        permits: u32,
    ) -> Result<(), AcquireError> {
        let mut state = self.state.lock();
        match state.queue.remove(handle) {
            Some(_waiter) => {
                let now = self.clock.now();
                let retry_after = state.pool.retry_after(permits, now);
                tracing::debug!(permits, ?retry_after, "queued acquire timed out");
                Err(AcquireError::TimedOut { retry_after })
            }
            None => {
                // Lost the race: a concurrent `release`/tick already popped
                // and granted us. Drain the now-resolved channel.
                drop(state);
                match receiver.try_recv() {
                    Ok(()) => Ok(()),
                    Err(_) => Err(AcquireError::TimedOut {
                        retry_after: Duration::ZERO,
                    }),
                }
            }
        }
    }
}

fn drain_queue<P: PermitPool>(pool: &mut P, queue: &mut WaitQueue<Waiter>, now: Instant) {
    while let Some(front) = queue.front() {
        if pool.try_acquire(front.permits, now) {
            if let Some(waiter) = queue.pop_front() {
                let _ = waiter.sender.send(());
            }
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system_clock;

    struct CountingPool {
        capacity: u32,
        in_use: u32,
    }

    impl PermitPool for CountingPool {
        fn try_acquire(&mut self, permits: u32, _now: Instant) -> bool {
            if self.in_use + permits <= self.capacity {
                self.in_use += permits;
                true
            } else {
                false
            }
        }

        fn release(&mut self, permits: u32) {
            self.in_use = self.in_use.saturating_sub(permits);
        }

        fn retry_after(&self, _permits: u32, _now: Instant) -> Duration {
            Duration::from_millis(5)
        }
    }

    // Real timing, not `FakeClock`: these tests exercise the engine's own
    // timeout/cancellation race, which runs on tokio's timer regardless of
    // what `Clock` reports. `FakeClock` is for algorithm-level replenishment
    // tests (fixed window, token bucket, sliding window) where the point is
    // ticking without real sleeps.
    fn engine(capacity: u32, max_queue_length: usize) -> Engine<CountingPool> {
        Engine::new(
            CountingPool {
                capacity,
                in_use: 0,
            },
            max_queue_length,
            system_clock(),
        )
    }

    #[tokio::test]
    async fn grants_immediately_when_capacity_available() {
        let engine = engine(2, 4);
        engine.acquire(1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(engine.with_pool(|p| p.in_use), 1);
    }

    #[tokio::test]
    async fn rejects_when_queue_is_full_and_pool_is_exhausted() {
        let engine = Arc::new(engine(1, 0));
        engine.acquire(1, Duration::from_secs(1)).await.unwrap();
        let err = engine
            .acquire(1, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::Rejected { .. }));
    }

    #[tokio::test]
    async fn zero_timeout_is_a_non_blocking_probe() {
        let engine = engine(1, 4);
        engine.acquire(1, Duration::from_secs(1)).await.unwrap();
        let err = engine.acquire(1, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, AcquireError::Rejected { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn release_grants_queued_waiter_in_fifo_order() {
        let engine = Arc::new(engine(1, 4));
        engine.acquire(1, Duration::from_secs(1)).await.unwrap();

        let engine2 = engine.clone();
        let waiter = tokio::spawn(async move { engine2.acquire(1, Duration::from_secs(5)).await });
        tokio::task::yield_now().await;

        engine.release(1);
        let result = waiter.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn timed_out_waiter_is_removed_and_reports_retry_after() {
        let engine = engine(1, 4);
        engine.acquire(1, Duration::from_secs(1)).await.unwrap();
        let err = engine
            .acquire(1, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::TimedOut { .. }));
        assert_eq!(engine.queued_len(), 0);
    }
}
