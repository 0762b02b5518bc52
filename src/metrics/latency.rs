//! Rolling latency window
//!
//! Bounded sample buffer with exact min/max, an exponential moving average
//! and a p95 that is recomputed on demand (once per metrics tick) rather
//! than on every sample.

use serde::{Deserialize, Serialize};

/// Samples kept before the window is truncated to its newest half
pub const MAX_SAMPLES: usize = 10_000;

/// Smoothing factor of the moving average
pub const EMA_ALPHA: f64 = 0.05;

/// Latency distribution at a point in time (milliseconds)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySnapshot {
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    pub p95_ms: f64,
    /// Samples currently in the window
    pub window: usize,
    /// Samples recorded since start
    pub total: u64,
}

#[derive(Debug, Default)]
pub struct LatencyWindow {
    samples: Vec<f64>,
    min: Option<f64>,
    max: Option<f64>,
    avg: Option<f64>,
    p95: f64,
    total: u64,
}

impl LatencyWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, sample_ms: f64) {
        if !sample_ms.is_finite() || sample_ms < 0.0 {
            return;
        }

        self.samples.push(sample_ms);
        if self.samples.len() > MAX_SAMPLES {
            let excess = self.samples.len() - MAX_SAMPLES / 2;
            self.samples.drain(..excess);
        }

        self.min = Some(self.min.map_or(sample_ms, |m| m.min(sample_ms)));
        self.max = Some(self.max.map_or(sample_ms, |m| m.max(sample_ms)));
        self.avg = Some(match self.avg {
            Some(avg) => avg * (1.0 - EMA_ALPHA) + sample_ms * EMA_ALPHA,
            None => sample_ms,
        });
        self.total += 1;
    }

    /// Sort a copy of the window and cache its 95th percentile
    pub fn recompute_p95(&mut self) -> f64 {
        if self.samples.is_empty() {
            self.p95 = 0.0;
            return self.p95;
        }

        let mut sorted = self.samples.clone();
        sorted.sort_by(f64::total_cmp);
        let idx = ((sorted.len() as f64 * 0.95) as usize).min(sorted.len() - 1);
        self.p95 = sorted[idx];
        self.p95
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            min_ms: self.min.unwrap_or_default(),
            max_ms: self.max.unwrap_or_default(),
            avg_ms: self.avg.unwrap_or_default(),
            p95_ms: self.p95,
            window: self.samples.len(),
            total: self.total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_max_are_exact() {
        let mut window = LatencyWindow::new();
        for sample in [5.0, 1.0, 9.0, 3.0] {
            window.record(sample);
        }
        let snap = window.snapshot();
        assert_eq!(snap.min_ms, 1.0);
        assert_eq!(snap.max_ms, 9.0);
        assert_eq!(snap.total, 4);
    }

    #[test]
    fn average_is_exponential() {
        let mut window = LatencyWindow::new();
        window.record(100.0);
        window.record(200.0);
        // 100 * 0.95 + 200 * 0.05
        assert!((window.snapshot().avg_ms - 105.0).abs() < 1e-9);
    }

    #[test]
    fn p95_only_changes_on_recompute() {
        let mut window = LatencyWindow::new();
        for i in 1..=100 {
            window.record(f64::from(i));
        }
        assert_eq!(window.snapshot().p95_ms, 0.0);
        assert_eq!(window.recompute_p95(), 96.0);
        assert_eq!(window.snapshot().p95_ms, 96.0);
    }

    #[test]
    fn overflow_keeps_newest_half() {
        let mut window = LatencyWindow::new();
        for i in 0..=MAX_SAMPLES {
            window.record(i as f64);
        }
        assert_eq!(window.len(), MAX_SAMPLES / 2);
        window.recompute_p95();
        assert_eq!(window.snapshot().min_ms, 0.0, "min is tracked exactly, not from the window");
        assert_eq!(window.snapshot().total, MAX_SAMPLES as u64 + 1);
    }

    #[test]
    fn rejects_non_finite_samples() {
        let mut window = LatencyWindow::new();
        window.record(f64::NAN);
        window.record(-1.0);
        assert!(window.is_empty());
    }
}
