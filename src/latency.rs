use crate::config::LatencyTrackingConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct LatencyMeasurement {
    pub latency_ms: f64,
    pub timestamp: DateTime<Utc>,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct LatencyStats {
    pub p50: f64,
    pub p95: f64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
    pub tokens_per_second: f64,
}

/// Per-model rolling latency window with percentile queries.
///
/// Each model owns a circular buffer of fixed capacity; recording drops
/// non-finite, negative, and outlier samples. Critical sections are short
/// and do no I/O.
#[derive(Debug)]
pub struct LatencyTracker {
    rings: Mutex<HashMap<String, VecDeque<LatencyMeasurement>>>,
    config: LatencyTrackingConfig,
}

impl LatencyTracker {
    pub fn new(config: LatencyTrackingConfig) -> Self {
        Self {
            rings: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn record_latency(&self, model: &str, latency_ms: f64, output_tokens: Option<u64>) {
        if !self.config.enabled {
            return;
        }
        if !latency_ms.is_finite() || latency_ms < 0.0 {
            return;
        }
        if latency_ms > self.config.outlier_threshold_ms {
            debug!(model, latency_ms, "dropping latency outlier");
            return;
        }

        let measurement = LatencyMeasurement {
            latency_ms,
            timestamp: Utc::now(),
            output_tokens: output_tokens.unwrap_or(0),
        };

        let Ok(mut rings) = self.rings.lock() else {
            return;
        };
        let ring = rings.entry(model.to_string()).or_default();
        if ring.len() == self.config.buffer_size {
            ring.pop_front();
        }
        ring.push_back(measurement);
    }

    /// Stats over the current window, or `None` when no samples exist.
    /// Percentiles use `sorted[ceil(p/100 * n) - 1]` on a sorted copy.
    pub fn get_latency_stats(&self, model: &str) -> Option<LatencyStats> {
        let rings = self.rings.lock().ok()?;
        let ring = rings.get(model)?;
        if ring.is_empty() {
            return None;
        }

        let mut sorted: Vec<f64> = ring.iter().map(|m| m.latency_ms).collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let n = sorted.len();

        let sum: f64 = sorted.iter().sum();
        let avg = sum / n as f64;

        let rates: Vec<f64> = ring
            .iter()
            .filter(|m| m.output_tokens > 0)
            .map(|m| m.output_tokens as f64 / (m.latency_ms / 1000.0))
            .collect();
        let tokens_per_second = if rates.is_empty() {
            0.0
        } else {
            rates.iter().sum::<f64>() / rates.len() as f64
        };

        Some(LatencyStats {
            p50: percentile(&sorted, 50.0),
            p95: percentile(&sorted, 95.0),
            avg,
            min: sorted[0],
            max: sorted[n - 1],
            count: n,
            tokens_per_second,
        })
    }

    pub fn tracked_models(&self) -> Vec<String> {
        self.rings
            .lock()
            .map(|rings| rings.keys().cloned().collect())
            .unwrap_or_default()
    }
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    let rank = (p / 100.0 * n as f64).ceil() as usize;
    sorted[rank.clamp(1, n) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(buffer: usize) -> LatencyTracker {
        LatencyTracker::new(LatencyTrackingConfig {
            enabled: true,
            buffer_size: buffer,
            outlier_threshold_ms: 60_000.0,
        })
    }

    #[test]
    fn single_sample_is_every_percentile() {
        let tracker = tracker(100);
        tracker.record_latency("m", 250.0, None);

        let stats = tracker.get_latency_stats("m").unwrap();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.p50, 250.0);
        assert_eq!(stats.p95, 250.0);
        assert_eq!(stats.min, 250.0);
        assert_eq!(stats.max, 250.0);
    }

    #[test]
    fn five_samples_match_percentile_table() {
        let tracker = tracker(100);
        for latency in [100.0, 200.0, 300.0, 400.0, 500.0] {
            tracker.record_latency("m", latency, None);
        }

        let stats = tracker.get_latency_stats("m").unwrap();
        // n=5: p50 -> ceil(2.5)-1 = index 2; p95 -> ceil(4.75)-1 = index 4
        assert_eq!(stats.p50, 300.0);
        assert_eq!(stats.p95, 500.0);
        assert_eq!(stats.avg, 300.0);
    }

    #[test]
    fn ten_samples_match_percentile_table() {
        let tracker = tracker(100);
        for i in 1..=10 {
            tracker.record_latency("m", (i * 100) as f64, None);
        }

        let stats = tracker.get_latency_stats("m").unwrap();
        // n=10: p50 -> ceil(5)-1 = index 4; p95 -> ceil(9.5)-1 = index 9
        assert_eq!(stats.p50, 500.0);
        assert_eq!(stats.p95, 1000.0);
    }

    #[test]
    fn invalid_samples_are_dropped() {
        let tracker = tracker(100);
        tracker.record_latency("m", -5.0, None);
        tracker.record_latency("m", f64::NAN, None);
        tracker.record_latency("m", f64::INFINITY, None);
        tracker.record_latency("m", 70_000.0, None); // above outlier threshold

        assert!(tracker.get_latency_stats("m").is_none());
    }

    #[test]
    fn ring_keeps_most_recent_samples() {
        let tracker = tracker(3);
        for latency in [100.0, 200.0, 300.0, 400.0] {
            tracker.record_latency("m", latency, None);
        }

        let stats = tracker.get_latency_stats("m").unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.min, 200.0);
        assert_eq!(stats.max, 400.0);
    }

    #[test]
    fn tokens_per_second_averages_per_sample_rates() {
        let tracker = tracker(100);
        tracker.record_latency("m", 1000.0, Some(100)); // 100 tok/s
        tracker.record_latency("m", 500.0, Some(100)); // 200 tok/s
        tracker.record_latency("m", 2000.0, None); // no tokens, excluded

        let stats = tracker.get_latency_stats("m").unwrap();
        assert_eq!(stats.tokens_per_second, 150.0);
    }

    #[test]
    fn zero_latency_with_tokens_is_infinite_rate() {
        let tracker = tracker(100);
        tracker.record_latency("m", 0.0, Some(10));

        let stats = tracker.get_latency_stats("m").unwrap();
        assert!(stats.tokens_per_second.is_infinite());
    }

    #[test]
    fn unknown_model_has_no_stats() {
        let tracker = tracker(100);
        assert!(tracker.get_latency_stats("missing").is_none());
    }

    #[test]
    fn disabled_tracker_records_nothing() {
        let tracker = LatencyTracker::new(LatencyTrackingConfig {
            enabled: false,
            buffer_size: 10,
            outlier_threshold_ms: 60_000.0,
        });
        tracker.record_latency("m", 100.0, None);
        assert!(tracker.get_latency_stats("m").is_none());
    }
}
