//! Time source abstraction.
//!
//! Replenishment and circuit-breaker timeout logic is expressed entirely in
//! terms of `Instant` comparisons, so it can be driven by a fake clock in
//! tests instead of sleeping real wall-clock durations. The default
//! `SystemClock` is what every mechanism uses unless a test wires in a
//! `FakeClock`.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A monotonic time source.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Returns the current instant according to this clock.
    fn now(&self) -> Instant;
}

/// The real, `Instant::now`-backed clock. Used by default everywhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Returns the default clock shared by mechanisms that don't take an
/// explicit one.
pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

/// A manually-advanced clock for deterministic tests.
///
/// `now()` never moves on its own; call [`FakeClock::advance`] to simulate
/// elapsed time.
#[derive(Debug)]
pub struct FakeClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl FakeClock {
    /// Creates a clock anchored at the real current instant with zero
    /// elapsed offset.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        })
    }

    /// Moves this clock forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        let mut offset = self.offset.lock();
        *offset += duration;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances_monotonically() {
        let clock = FakeClock::new();
        let t0 = clock.now();
        clock.advance(Duration::from_millis(500));
        let t1 = clock.now();
        assert!(t1 > t0);
        assert_eq!(t1 - t0, Duration::from_millis(500));
    }
}
