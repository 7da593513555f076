// src/resource/stats.rs
//! Rolling call statistics for a resource gate

use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
struct CallRecord {
    latency: Duration,
    success: bool,
}

/// Rolling latency / success-rate window over the last N settled calls
#[derive(Debug, Clone)]
pub struct CallStats {
    window: VecDeque<CallRecord>,
    capacity: usize,
    total_calls: u64,
    total_failures: u64,
}

impl CallStats {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            total_calls: 0,
            total_failures: 0,
        }
    }

    /// Record a settled call
    pub fn record(&mut self, latency: Duration, success: bool) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(CallRecord { latency, success });
        self.total_calls += 1;
        if !success {
            self.total_failures += 1;
        }
    }

    /// Average latency over the window (0 when empty)
    pub fn avg_latency_ms(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let total: f64 = self
            .window
            .iter()
            .map(|r| r.latency.as_micros() as f64 / 1000.0)
            .sum();
        total / self.window.len() as f64
    }

    /// Success rate over the window (100 when empty)
    pub fn success_rate_pct(&self) -> f64 {
        if self.window.is_empty() {
            return 100.0;
        }
        let ok = self.window.iter().filter(|r| r.success).count();
        (ok as f64 / self.window.len() as f64) * 100.0
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn total_calls(&self) -> u64 {
        self.total_calls
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_window() {
        let stats = CallStats::new(10);
        assert_eq!(stats.avg_latency_ms(), 0.0);
        assert_eq!(stats.success_rate_pct(), 100.0);
    }

    #[test]
    fn test_rolling_window() {
        let mut stats = CallStats::new(2);
        stats.record(Duration::from_millis(100), false);
        stats.record(Duration::from_millis(200), true);
        stats.record(Duration::from_millis(400), true);

        // Oldest record evicted
        assert_eq!(stats.window_len(), 2);
        assert_eq!(stats.avg_latency_ms(), 300.0);
        assert_eq!(stats.success_rate_pct(), 100.0);
        assert_eq!(stats.total_calls(), 3);
        assert_eq!(stats.total_failures(), 1);
    }
}
