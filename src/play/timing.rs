//! Rolling frame-time statistics for the play loop header.

use std::collections::VecDeque;
use std::time::Duration;

/// Rolling window of per-tick durations in milliseconds.
#[derive(Clone, Debug)]
pub struct FrameTimer {
    samples: VecDeque<f32>,
    max_samples: usize,
    total_ticks: u64,
}

impl FrameTimer {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples: max_samples.max(1),
            total_ticks: 0,
        }
    }

    pub fn record(&mut self, elapsed: Duration) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(elapsed.as_secs_f32() * 1000.0);
        self.total_ticks += 1;
    }

    pub fn total_ticks(&self) -> u64 {
        self.total_ticks
    }

    pub fn latest_ms(&self) -> Option<f32> {
        self.samples.back().copied()
    }

    pub fn mean_ms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f32>() / self.samples.len() as f32
    }

    /// 99th percentile over the window.
    pub fn p99_ms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut values: Vec<f32> = self.samples.iter().copied().collect();
        values.sort_by(f32::total_cmp);
        let idx = ((values.len() as f32) * 0.99) as usize;
        values[idx.min(values.len() - 1)]
    }

    /// Throughput implied by the mean tick time.
    pub fn achieved_fps(&self) -> f32 {
        let mean = self.mean_ms();
        if mean > 0.0 {
            1000.0 / mean
        } else {
            0.0
        }
    }
}

impl Default for FrameTimer {
    fn default() -> Self {
        Self::new(120)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_rolls() {
        let mut t = FrameTimer::new(3);
        for ms in [10, 20, 30, 40] {
            t.record(Duration::from_millis(ms));
        }
        assert_eq!(t.total_ticks(), 4);
        assert!((t.mean_ms() - 30.0).abs() < 1e-3);
        assert!((t.latest_ms().unwrap() - 40.0).abs() < 1e-3);
    }

    #[test]
    fn test_p99_and_fps() {
        let mut t = FrameTimer::new(100);
        for _ in 0..99 {
            t.record(Duration::from_millis(10));
        }
        t.record(Duration::from_millis(500));
        assert!((t.p99_ms() - 500.0).abs() < 1e-3);
        assert!(t.achieved_fps() > 0.0);
    }

    #[test]
    fn test_empty() {
        let t = FrameTimer::default();
        assert_eq!(t.mean_ms(), 0.0);
        assert_eq!(t.p99_ms(), 0.0);
        assert_eq!(t.achieved_fps(), 0.0);
        assert!(t.latest_ms().is_none());
    }
}
