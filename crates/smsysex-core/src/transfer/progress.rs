//! Progress aggregation and throughput estimation.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Aggregated queue progress published to observers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueProgress {
    /// Bytes moved across all live items
    pub bytes_transferred: u64,
    /// Total bytes across all live items
    pub total_bytes: u64,
    /// Items currently transferring
    pub active: usize,
    /// Items waiting for a batch slot
    pub pending: usize,
    /// Recent throughput in bytes per second
    pub speed_bps: u64,
}

impl QueueProgress {
    /// Overall progress as a percentage (0.0 - 100.0).
    #[must_use]
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            100.0
        } else {
            (self.bytes_transferred as f64 / self.total_bytes as f64) * 100.0
        }
    }
}

/// Rolling window of throughput samples feeding the speed estimate.
#[derive(Debug)]
pub struct SpeedEstimator {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedEstimator {
    /// Create an estimator averaging over `window`.
    #[must_use]
    pub const fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    /// Record `bytes` moved at `now` and drop samples older than the
    /// window.
    pub fn record(&mut self, now: Instant, bytes: u64) {
        self.samples.push_back((now, bytes));
        while let Some(&(at, _)) = self.samples.front() {
            if now.duration_since(at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Current estimate in bytes per second.
    #[must_use]
    pub fn bytes_per_sec(&self, now: Instant) -> u64 {
        let Some(&(oldest, _)) = self.samples.front() else {
            return 0;
        };
        let total: u64 = self
            .samples
            .iter()
            .filter(|(at, _)| now.duration_since(*at) <= self.window)
            .map(|&(_, bytes)| bytes)
            .sum();
        let elapsed = now.duration_since(oldest).max(Duration::from_millis(1));
        (total as f64 / elapsed.as_secs_f64()) as u64
    }
}
