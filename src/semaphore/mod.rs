//! A counting semaphore with a bounded FIFO wait queue and per-acquire
//! timeout, suspending the calling task instead of busy-waiting.

pub(crate) mod engine;
pub(crate) mod queue;

use crate::clock::system_clock;
use crate::error::SemaphoreError;
use engine::{AcquireError, Engine, PermitPool};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A pluggable backend for where permit accounting actually lives.
///
/// The default, [`InMemorySemaphoreState`], tracks an in-process counter.
/// A caller that needs permits shared across processes (backed by Redis, a
/// database row, etc.) can implement this trait instead and hand it to
/// [`SuspendableSemaphore::with_state`].
pub trait SemaphoreState: Send + Sync {
    /// Total permits this semaphore was configured with.
    fn capacity(&self) -> u32;

    /// Permits currently checked out.
    fn permits_in_use(&self) -> u32;

    /// Attempts to check out `permits` atomically. Returns `true` if
    /// successful; on `false`, no permits were taken.
    fn try_acquire(&self, permits: u32) -> bool;

    /// Returns `permits` to the pool.
    fn release(&self, permits: u32);

    /// Marks the state closed. Implementations that hold external
    /// resources (a connection, a lease) should release them here; the
    /// default in-memory state has nothing to do.
    fn close(&self) {}
}

/// The default [`SemaphoreState`]: an in-process atomic counter.
#[derive(Debug)]
pub struct InMemorySemaphoreState {
    capacity: u32,
    in_use: AtomicU32,
}

impl InMemorySemaphoreState {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            in_use: AtomicU32::new(0),
        }
    }
}

impl SemaphoreState for InMemorySemaphoreState {
    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn permits_in_use(&self) -> u32 {
        self.in_use.load(Ordering::Acquire)
    }

    fn try_acquire(&self, permits: u32) -> bool {
        let mut current = self.in_use.load(Ordering::Acquire);
        loop {
            if current + permits > self.capacity {
                return false;
            }
            match self.in_use.compare_exchange_weak(
                current,
                current + permits,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    fn release(&self, permits: u32) {
        self.in_use.fetch_sub(permits, Ordering::AcqRel);
    }
}

/// Adapts any `Arc<dyn SemaphoreState>` to the internal `PermitPool`
/// contract the shared queueing engine drives.
struct StateAdapter(Arc<dyn SemaphoreState>);

impl PermitPool for StateAdapter {
    fn try_acquire(&mut self, permits: u32, _now: Instant) -> bool {
        self.0.try_acquire(permits)
    }

    fn release(&mut self, permits: u32) {
        self.0.release(permits);
    }

    fn retry_after(&self, _permits: u32, _now: Instant) -> Duration {
        // A plain semaphore only frees capacity on `release`, which drains
        // the queue itself; polling is just a safety net against a missed
        // wakeup, so a short fixed interval is enough.
        Duration::from_millis(10)
    }
}

/// A guard that returns its permits to the semaphore when dropped.
#[must_use = "dropping this guard immediately releases the permit(s)"]
pub struct SemaphorePermit<'a> {
    semaphore: &'a SuspendableSemaphore,
    permits: u32,
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.semaphore.engine.release(self.permits);
    }
}

/// A counting semaphore: up to `capacity` permits may be held at once.
/// Requests beyond capacity queue in FIFO order up to `max_queue_length`,
/// each bounded by its own `timeout`.
pub struct SuspendableSemaphore {
    state: Arc<dyn SemaphoreState>,
    engine: Engine<StateAdapter>,
}

impl SuspendableSemaphore {
    /// Creates a semaphore over an in-memory permit counter.
    ///
    /// Fails if `capacity` is zero.
    pub fn new(capacity: u32, max_queue_length: usize) -> Result<Self, SemaphoreError> {
        if capacity == 0 {
            return Err(SemaphoreError::InvalidArgument(
                crate::error::InvalidArgument::new("capacity must be positive"),
            ));
        }
        Ok(Self::with_state(
            Arc::new(InMemorySemaphoreState::new(capacity)),
            max_queue_length,
        ))
    }

    /// Creates a semaphore over a caller-supplied [`SemaphoreState`]
    /// backend.
    pub fn with_state(state: Arc<dyn SemaphoreState>, max_queue_length: usize) -> Self {
        let engine = Engine::new(StateAdapter(state.clone()), max_queue_length, system_clock());
        Self { state, engine }
    }

    /// Total permits this semaphore was configured with.
    pub fn capacity(&self) -> u32 {
        self.state.capacity()
    }

    /// Permits currently checked out.
    pub fn permits_in_use(&self) -> u32 {
        self.state.permits_in_use()
    }

    /// Number of requests currently queued, waiting for permits to free up.
    pub fn queue_length(&self) -> usize {
        self.engine.queued_len()
    }

    /// Acquires `permits`, suspending up to `timeout` if none are
    /// immediately available. Returns a guard that releases them on drop.
    ///
    /// Fails with [`SemaphoreError::Rejected`] if the wait queue is already
    /// at `max_queue_length`, or [`SemaphoreError::Timeout`] if `timeout`
    /// elapses first.
    pub async fn acquire(
        &self,
        permits: u32,
        timeout: Duration,
    ) -> Result<SemaphorePermit<'_>, SemaphoreError> {
        if permits == 0 || permits > self.capacity() {
            return Err(SemaphoreError::InvalidArgument(
                crate::error::InvalidArgument::new(
                    "permits must be positive and not exceed capacity",
                ),
            ));
        }
        match self.engine.acquire(permits, timeout).await {
            Ok(()) => Ok(SemaphorePermit {
                semaphore: self,
                permits,
            }),
            Err(AcquireError::Rejected { .. }) => Err(SemaphoreError::Rejected),
            Err(AcquireError::TimedOut { .. }) => Err(SemaphoreError::Timeout(timeout)),
        }
    }

    /// Closes the underlying state. Queued waiters are left to time out on
    /// their own terms; this does not cancel them.
    pub fn close(&self) {
        self.state.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_capacity() {
        assert!(SuspendableSemaphore::new(0, 4).is_err());
    }

    #[tokio::test]
    async fn acquire_and_release_round_trip() {
        let sem = SuspendableSemaphore::new(2, 4).unwrap();
        {
            let _permit = sem.acquire(2, Duration::from_secs(1)).await.unwrap();
            assert_eq!(sem.permits_in_use(), 2);
        }
        assert_eq!(sem.permits_in_use(), 0);
    }

    #[tokio::test]
    async fn rejects_request_exceeding_capacity() {
        let sem = SuspendableSemaphore::new(2, 4).unwrap();
        let err = sem.acquire(3, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, SemaphoreError::InvalidArgument(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn queued_request_is_granted_on_release() {
        let sem = Arc::new(SuspendableSemaphore::new(1, 4).unwrap());
        let permit = sem.acquire(1, Duration::from_secs(1)).await.unwrap();

        let sem2 = sem.clone();
        let waiter = tokio::spawn(async move { sem2.acquire(1, Duration::from_secs(5)).await });
        tokio::task::yield_now().await;
        assert_eq!(sem.queue_length(), 1);

        drop(permit);
        let second = waiter.await.unwrap().unwrap();
        assert_eq!(sem.permits_in_use(), 1);
        drop(second);
        assert_eq!(sem.permits_in_use(), 0);
    }

    #[tokio::test]
    async fn rejects_beyond_max_queue_length() {
        let sem = Arc::new(SuspendableSemaphore::new(1, 0).unwrap());
        let _permit = sem.acquire(1, Duration::from_secs(1)).await.unwrap();
        let err = sem
            .acquire(1, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, SemaphoreError::Rejected));
    }

    #[tokio::test]
    async fn acquire_times_out_while_queued() {
        let sem = Arc::new(SuspendableSemaphore::new(1, 4).unwrap());
        let _permit = sem.acquire(1, Duration::from_secs(1)).await.unwrap();
        let err = sem
            .acquire(1, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, SemaphoreError::Timeout(_)));
        assert_eq!(sem.queue_length(), 0);
    }
}
