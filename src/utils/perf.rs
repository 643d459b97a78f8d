//! Latency tracking for stages, decisions and renders
//!
//! Keeps a sliding window of recent durations and summarizes it.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// Tracks timing samples over a sliding window
#[derive(Debug, Clone)]
pub struct TimingTracker {
    samples: VecDeque<Duration>,
    max_samples: usize,
    total_recorded: u64,
}

impl Default for TimingTracker {
    fn default() -> Self {
        Self::new(128)
    }
}

impl TimingTracker {
    /// Create a new timing tracker with the specified window size
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples: max_samples.max(1),
            total_recorded: 0,
        }
    }

    /// Record a new timing sample
    pub fn record(&mut self, duration: Duration) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(duration);
        self.total_recorded += 1;
    }

    /// Get the average duration
    pub fn average(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.samples.iter().sum();
        total / self.samples.len() as u32
    }

    /// Get the minimum duration
    pub fn min(&self) -> Duration {
        self.samples.iter().min().copied().unwrap_or(Duration::ZERO)
    }

    /// Get the maximum duration
    pub fn max(&self) -> Duration {
        self.samples.iter().max().copied().unwrap_or(Duration::ZERO)
    }

    /// Get the 95th percentile duration
    pub fn percentile_95(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let mut sorted: Vec<_> = self.samples.iter().copied().collect();
        sorted.sort();
        let idx = (sorted.len() as f32 * 0.95) as usize;
        sorted.get(idx.min(sorted.len() - 1)).copied().unwrap_or(Duration::ZERO)
    }

    /// Number of samples currently in the window
    pub fn count(&self) -> usize {
        self.samples.len()
    }

    /// Number of samples ever recorded
    pub fn total_recorded(&self) -> u64 {
        self.total_recorded
    }

    /// Clear all samples
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Snapshot of the window for stats reporting
    pub fn summary(&self) -> LatencySummary {
        LatencySummary {
            samples: self.total_recorded,
            avg_ms: self.average().as_secs_f64() * 1000.0,
            min_ms: self.min().as_secs_f64() * 1000.0,
            max_ms: self.max().as_secs_f64() * 1000.0,
            p95_ms: self.percentile_95().as_secs_f64() * 1000.0,
        }
    }
}

/// Serializable latency snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub samples: u64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p95_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timing_tracker() {
        let mut tracker = TimingTracker::new(10);

        for i in 1..=5 {
            tracker.record(Duration::from_millis(i * 10));
        }

        assert_eq!(tracker.count(), 5);
        assert_eq!(tracker.min(), Duration::from_millis(10));
        assert_eq!(tracker.max(), Duration::from_millis(50));
        assert_eq!(tracker.average(), Duration::from_millis(30));
    }

    #[test]
    fn test_timing_tracker_window() {
        let mut tracker = TimingTracker::new(3);

        for i in 1..=5 {
            tracker.record(Duration::from_millis(i * 10));
        }

        // Window keeps the last 3, total keeps counting
        assert_eq!(tracker.count(), 3);
        assert_eq!(tracker.total_recorded(), 5);
        assert_eq!(tracker.min(), Duration::from_millis(30));
    }

    #[test]
    fn test_summary_of_empty_tracker() {
        let tracker = TimingTracker::default();
        let summary = tracker.summary();
        assert_eq!(summary.samples, 0);
        assert_eq!(summary.avg_ms, 0.0);
    }
}
