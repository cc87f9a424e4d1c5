use crate::config::MetricsConfig;
use crate::types::{ComplexityTier, OptimizerMetrics, WindowingMethod};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error};

pub mod reporter;

pub use reporter::{MetricsReporter, SavingsReport, TopSaving};

/// Size trigger for a flush, and the cap on entries requeued after a failed
/// write.
const FLUSH_BATCH: usize = 100;

#[derive(Debug, Default)]
struct CollectorState {
    ring: VecDeque<OptimizerMetrics>,
    pending: Vec<OptimizerMetrics>,
}

#[derive(Debug)]
struct CollectorInner {
    state: Mutex<CollectorState>,
    reporter: MetricsReporter,
    config: MetricsConfig,
}

/// Bounded in-memory metrics ring plus a durable append-only log.
///
/// `record` is cheap and non-blocking: entries land in the ring (for live
/// queries) and a pending buffer that is flushed to the reporter in batches,
/// off the request path when a runtime is available.
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    inner: Arc<CollectorInner>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct OptimizerStats {
    pub total_requests: usize,
    pub total_tokens_saved: i64,
    pub avg_tokens_saved: f64,
    pub total_cost_saved: f64,
    pub windowing_usage_percent: f64,
    pub caching_usage_percent: f64,
    pub routing_usage_percent: f64,
    pub classification_distribution: HashMap<ComplexityTier, usize>,
    pub routing_tier_distribution: HashMap<ComplexityTier, usize>,
    pub avg_latency_ms: f64,
}

impl MetricsCollector {
    pub fn new(config: MetricsConfig) -> Self {
        let reporter = MetricsReporter::new(&config.base_dir, &config.log_path);
        Self {
            inner: Arc::new(CollectorInner {
                state: Mutex::new(CollectorState::default()),
                reporter,
                config,
            }),
        }
    }

    pub fn enabled(&self) -> bool {
        self.inner.config.enabled
    }

    pub fn reporter(&self) -> &MetricsReporter {
        &self.inner.reporter
    }

    /// Record one request. Disabled collectors drop everything.
    pub fn record(&self, metrics: OptimizerMetrics) {
        if !self.inner.config.enabled {
            return;
        }

        let should_flush = {
            let Ok(mut state) = self.inner.state.lock() else {
                return;
            };
            if state.ring.len() == self.inner.config.ring_buffer_size {
                state.ring.pop_front();
            }
            state.ring.push_back(metrics.clone());
            state.pending.push(metrics);
            state.pending.len() >= FLUSH_BATCH
        };

        if should_flush {
            self.flush_in_background();
        }
    }

    /// Move the flush off the caller's path when a runtime is available.
    fn flush_in_background(&self) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let collector = self.clone();
                handle.spawn_blocking(move || collector.flush());
            }
            Err(_) => self.flush(),
        }
    }

    /// Drain pending entries and hand them to the reporter. Disk I/O happens
    /// outside the lock. On write failure, the most recent batch-worth of
    /// entries is requeued once.
    pub fn flush(&self) {
        let batch = {
            let Ok(mut state) = self.inner.state.lock() else {
                return;
            };
            std::mem::take(&mut state.pending)
        };
        if batch.is_empty() {
            return;
        }

        if let Err(e) = self.inner.reporter.write_metrics(&batch) {
            error!("metrics flush failed, requeueing most recent entries: {}", e);
            let mut retry = batch;
            if retry.len() > FLUSH_BATCH {
                retry.drain(..retry.len() - FLUSH_BATCH);
            }
            if let Ok(mut state) = self.inner.state.lock() {
                let newer = std::mem::take(&mut state.pending);
                retry.extend(newer);
                state.pending = retry;
            }
        }
    }

    /// Periodic flush safety net; runs until the task is aborted.
    pub fn start_flush_timer(&self) -> tokio::task::JoinHandle<()> {
        let collector = self.clone();
        let period = Duration::from_millis(collector.inner.config.flush_interval_ms.max(1000));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let c = collector.clone();
                let _ = tokio::task::spawn_blocking(move || c.flush()).await;
                debug!("periodic metrics flush");
            }
        })
    }

    /// Snapshot of the ring contents, oldest first.
    pub fn get_all(&self) -> Vec<OptimizerMetrics> {
        self.inner
            .state
            .lock()
            .map(|state| state.ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Aggregates over the ring contents.
    pub fn get_stats(&self) -> OptimizerStats {
        let all = self.get_all();
        if all.is_empty() {
            return OptimizerStats::default();
        }

        let total_requests = all.len();
        let total_tokens_saved: i64 = all.iter().filter_map(|m| m.tokens_saved).sum();
        let total_cost_saved: f64 = all.iter().filter_map(|m| m.estimated_cost_saved).sum();

        let windowed = all
            .iter()
            .filter(|m| m.windowing_method != WindowingMethod::None)
            .count();
        let cached = all
            .iter()
            .filter(|m| m.cache_breakpoints_injected > 0)
            .count();
        let routed = all.iter().filter(|m| m.routing_applied).count();

        let mut classification_distribution: HashMap<ComplexityTier, usize> = HashMap::new();
        let mut routing_tier_distribution: HashMap<ComplexityTier, usize> = HashMap::new();
        for record in &all {
            if let Some(tier) = record.classified_tier {
                *classification_distribution.entry(tier).or_default() += 1;
                if record.routing_applied {
                    *routing_tier_distribution.entry(tier).or_default() += 1;
                }
            }
        }

        let latencies: Vec<u64> = all.iter().filter_map(|m| m.latency_ms).collect();
        let avg_latency_ms = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<u64>() as f64 / latencies.len() as f64
        };

        let percent = |count: usize| count as f64 / total_requests as f64 * 100.0;

        OptimizerStats {
            total_requests,
            total_tokens_saved,
            avg_tokens_saved: total_tokens_saved as f64 / total_requests as f64,
            total_cost_saved,
            windowing_usage_percent: percent(windowed),
            caching_usage_percent: percent(cached),
            routing_usage_percent: percent(routed),
            classification_distribution,
            routing_tier_distribution,
            avg_latency_ms,
        }
    }
}
