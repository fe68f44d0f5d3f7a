//! Count-based sliding window of success/failure outcomes.

use crate::error::InvalidArgument;
use crate::ring_buffer::RingBuffer;

/// Records a bounded history of boolean outcomes (`true` = success) and
/// reports the current failure rate, gated by a minimum-throughput
/// threshold.
///
/// A time-based variant (partitioning outcomes into aging time segments) is
/// deliberately not implemented here; this count-based variant is cheaper
/// and is what every caller in this crate needs.
#[derive(Debug, Clone)]
pub struct FailureRateWindow {
    buffer: RingBuffer<bool>,
    minimum_throughput: u64,
    /// Monotonically increasing count of records since the last `clear`.
    records: u64,
}

impl FailureRateWindow {
    /// Creates a window of `capacity` outcomes, reporting `0.0` until at
    /// least `minimum_throughput` outcomes have been recorded.
    ///
    /// Fails if either argument is non-positive.
    pub fn new(capacity: usize, minimum_throughput: u64) -> Result<Self, InvalidArgument> {
        if minimum_throughput == 0 {
            return Err(InvalidArgument::new("minimum_throughput must be positive"));
        }
        Ok(Self {
            buffer: RingBuffer::new(capacity)?,
            minimum_throughput,
            records: 0,
        })
    }

    /// Records a success.
    pub fn record_success(&mut self) {
        self.buffer.add(true);
        self.records += 1;
    }

    /// Records a failure.
    pub fn record_failure(&mut self) {
        self.buffer.add(false);
        self.records += 1;
    }

    /// Records a boolean outcome (`true` = success).
    pub fn record(&mut self, success: bool) {
        if success {
            self.record_success();
        } else {
            self.record_failure();
        }
    }

    /// Total outcomes recorded since construction or the last `clear`, even
    /// past the point where older ones have been evicted from the window.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Number of outcomes currently held in the window (`<= capacity`).
    pub fn len(&self) -> usize {
        self.buffer.size()
    }

    /// `true` if no outcome is currently held.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Current failure rate in `[0.0, 1.0]`.
    ///
    /// Returns `0.0` until `records() >= minimum_throughput`; otherwise the
    /// fraction of `false` entries among those currently in the window.
    pub fn current_failure_rate(&self) -> f64 {
        if self.records < self.minimum_throughput {
            return 0.0;
        }
        let size = self.buffer.size();
        if size == 0 {
            return 0.0;
        }
        self.buffer.count(|outcome| !*outcome) as f64 / size as f64
    }

    /// Resets the window and the records counter.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.records = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_construction() {
        assert!(FailureRateWindow::new(0, 1).is_err());
        assert!(FailureRateWindow::new(4, 0).is_err());
    }

    #[test]
    fn gated_below_minimum_throughput() {
        let mut window = FailureRateWindow::new(10, 4).unwrap();
        window.record_failure();
        window.record_failure();
        window.record_failure();
        assert_eq!(window.current_failure_rate(), 0.0);
    }

    #[test]
    fn reports_rate_once_gate_is_met() {
        let mut window = FailureRateWindow::new(4, 4).unwrap();
        window.record_failure();
        window.record_failure();
        window.record_failure();
        window.record_failure();
        assert_eq!(window.current_failure_rate(), 1.0);
    }

    #[test]
    fn rate_tracks_most_recent_window() {
        let mut window = FailureRateWindow::new(4, 4).unwrap();
        for success in [true, true, false, false, false] {
            window.record(success);
        }
        // window now holds the last 4 records: [true, false, false, false]
        assert!((window.current_failure_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn clear_resets_gate_and_contents() {
        let mut window = FailureRateWindow::new(4, 2).unwrap();
        window.record_failure();
        window.record_failure();
        assert!(window.current_failure_rate() > 0.0);
        window.clear();
        assert_eq!(window.records(), 0);
        assert_eq!(window.current_failure_rate(), 0.0);
    }
}
