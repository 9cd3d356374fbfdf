//! Smoothed latency and jitter from liveness-probe samples.

use std::collections::VecDeque;

/// Window used when a room doesn't configure one.
const DEFAULT_WINDOW: usize = 10;

/// Bounded ring buffer of one-way latency samples for one participant.
///
/// Each sample is half a probe's round trip, in milliseconds. Only the
/// last `window` samples count:
///
/// - **latency** is their mean;
/// - **jitter** is the mean absolute difference between consecutive
///   samples (IPDV, inter-packet delay variation).
///
/// ```
/// use roomcast_session::LatencyEstimator;
///
/// let mut est = LatencyEstimator::default();
/// for sample in [40.0, 42.0, 38.0, 44.0] {
///     est.record(sample);
/// }
/// assert_eq!(est.latency(), 41.0);
/// assert_eq!(est.jitter(), 4.0);
/// ```
#[derive(Debug, Clone)]
pub struct LatencyEstimator {
    window: usize,
    samples: VecDeque<f64>,
}

impl Default for LatencyEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl LatencyEstimator {
    /// A window of 0 is treated as 1.
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            samples: VecDeque::with_capacity(window),
        }
    }

    /// Adds a sample, evicting the oldest once the window is full.
    ///
    /// Negative and non-finite samples are ignored.
    pub fn record(&mut self, sample_ms: f64) {
        if !sample_ms.is_finite() || sample_ms < 0.0 {
            tracing::debug!(sample_ms, "ignoring invalid latency sample");
            return;
        }
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(sample_ms);
    }

    /// Mean of the samples in the window, or 0 with no samples.
    pub fn latency(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    /// Mean absolute difference of consecutive samples, or 0 with fewer
    /// than two samples.
    pub fn jitter(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let total: f64 = self
            .samples
            .iter()
            .zip(self.samples.iter().skip(1))
            .map(|(a, b)| (b - a).abs())
            .sum();
        total / (self.samples.len() - 1) as f64
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_samples(window: usize, samples: &[f64]) -> LatencyEstimator {
        let mut est = LatencyEstimator::new(window);
        for &s in samples {
            est.record(s);
        }
        est
    }

    #[test]
    fn test_empty_estimator_reports_zero() {
        let est = LatencyEstimator::default();
        assert_eq!(est.latency(), 0.0);
        assert_eq!(est.jitter(), 0.0);
        assert!(est.is_empty());
        assert_eq!(est.window(), 10);
    }

    #[test]
    fn test_single_sample_has_no_jitter() {
        let est = with_samples(10, &[120.0]);
        assert_eq!(est.latency(), 120.0);
        assert_eq!(est.jitter(), 0.0);
    }

    #[test]
    fn test_latency_and_jitter_for_known_samples() {
        // |42-40| + |38-42| + |44-38| = 12 over 3 differences.
        let est = with_samples(10, &[40.0, 42.0, 38.0, 44.0]);
        assert_eq!(est.latency(), 41.0);
        assert_eq!(est.jitter(), 4.0);
    }

    #[test]
    fn test_probe_round_trips_are_halved_before_estimating() {
        use std::time::Duration;

        use roomcast_protocol::SessionId;
        use tokio::time::Instant;

        use crate::PendingPings;

        let a = SessionId::from("a");
        let mut pings = PendingPings::new();
        let mut est = LatencyEstimator::default();
        let t0 = Instant::now();
        for rtt in [80, 84, 76, 88] {
            let id = pings.issue(&a, t0);
            let one_way = pings.resolve(&a, id, t0 + Duration::from_millis(rtt)).unwrap();
            est.record(one_way.as_secs_f64() * 1000.0);
        }

        // One-way samples [40, 42, 38, 44].
        assert!((est.latency() - 41.0).abs() < 1e-9);
        assert!((est.jitter() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_steady_samples_have_zero_jitter() {
        let est = with_samples(10, &[50.0; 6]);
        assert_eq!(est.latency(), 50.0);
        assert_eq!(est.jitter(), 0.0);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let est = with_samples(3, &[1000.0, 10.0, 20.0, 30.0]);
        assert_eq!(est.len(), 3);
        assert_eq!(est.latency(), 20.0);
        assert_eq!(est.jitter(), 10.0);
    }

    #[test]
    fn test_zero_window_keeps_latest_sample() {
        let est = with_samples(0, &[10.0, 20.0]);
        assert_eq!(est.window(), 1);
        assert_eq!(est.latency(), 20.0);
    }

    #[test]
    fn test_record_ignores_invalid_samples() {
        let est = with_samples(10, &[f64::NAN, -5.0, f64::INFINITY, 30.0]);
        assert_eq!(est.len(), 1);
        assert_eq!(est.latency(), 30.0);
    }
}
