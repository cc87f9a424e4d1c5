use crate::budget::KahanSum;
use crate::config::{AbExperimentConfig, AbTestingConfig};
use crate::error::{Result, SlimclawError};
use crate::types::ComplexityTier;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::debug;

const ASSIGNMENT_TTL: i64 = 60 * 60; // seconds
const DEFAULT_MAX_PENDING: usize = 1000;
const DEFAULT_MIN_SAMPLES: usize = 30;
/// Relative difference in average latency above which a two-variant
/// experiment is called significant.
const SIGNIFICANCE_RATIO: f64 = 0.2;

#[derive(Debug, Clone, Serialize)]
pub struct AbAssignment {
    pub experiment_id: String,
    pub variant_id: String,
    pub model: Option<String>,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct AbOutcome {
    pub latency_ms: f64,
    pub cost: f64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Default)]
struct VariantAccumulator {
    count: usize,
    total_latency_ms: f64,
    total_cost: KahanSum,
    total_output_tokens: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VariantResult {
    pub variant_id: String,
    pub count: usize,
    pub avg_latency_ms: i64,
    pub avg_cost: f64,
    pub avg_output_tokens: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentResults {
    pub experiment_id: String,
    pub variants: Vec<VariantResult>,
    pub significant: bool,
}

#[derive(Debug, Default)]
struct AbState {
    assignments: HashMap<String, AbAssignment>,
    // Insertion order for FIFO eviction; stale keys are skipped on pop.
    order: VecDeque<String>,
    accumulators: HashMap<(String, String), VariantAccumulator>,
}

/// Deterministic weighted A/B assignment with outcome aggregation.
///
/// Assignments are keyed by run id, expire after an hour, and are dropped
/// once an outcome is recorded so a run is never counted twice.
#[derive(Debug)]
pub struct AbTestManager {
    experiments: Vec<AbExperimentConfig>,
    enabled: bool,
    max_pending: usize,
    state: Mutex<AbState>,
}

impl AbTestManager {
    pub fn new(config: &AbTestingConfig) -> Result<Self> {
        for experiment in &config.experiments {
            if experiment.variants.is_empty() {
                return Err(SlimclawError::Config(format!(
                    "A/B experiment {} has no variants",
                    experiment.id
                )));
            }
            let total: u32 = experiment.variants.iter().map(|v| v.weight).sum();
            if total != 100 {
                return Err(SlimclawError::Config(format!(
                    "A/B experiment {} variant weights sum to {}, expected 100",
                    experiment.id, total
                )));
            }
        }

        Ok(Self {
            experiments: config.experiments.clone(),
            enabled: config.enabled,
            max_pending: DEFAULT_MAX_PENDING,
            state: Mutex::new(AbState::default()),
        })
    }

    /// Assign a run to a variant of the active experiment for its tier, if
    /// one exists. Deterministic in the run id.
    pub fn assign(&self, tier: ComplexityTier, run_id: &str) -> Option<AbAssignment> {
        if !self.enabled {
            return None;
        }

        let now = Utc::now();
        let experiment = self.experiments.iter().find(|e| {
            e.tier == tier
                && e.status == "active"
                && e.end_at.map(|end| now < end).unwrap_or(true)
        })?;

        let bucket = hash_run_id(run_id) % 100;
        let mut cumulative = 0u32;
        let variant = experiment.variants.iter().find(|v| {
            cumulative += v.weight;
            cumulative > bucket
        })?;

        let assignment = AbAssignment {
            experiment_id: experiment.id.clone(),
            variant_id: variant.id.clone(),
            model: variant.model.clone(),
            assigned_at: now,
        };

        let mut state = self.state.lock().ok()?;
        reap_expired(&mut state, now);
        if state.assignments.len() >= self.max_pending {
            evict_to_capacity(&mut state, self.max_pending * 8 / 10);
        }

        state
            .assignments
            .insert(run_id.to_string(), assignment.clone());
        state.order.push_back(run_id.to_string());

        debug!(
            run_id,
            experiment = %assignment.experiment_id,
            variant = %assignment.variant_id,
            "assigned A/B variant"
        );
        Some(assignment)
    }

    /// Fold a completed run into its variant accumulator. A run without a
    /// pending assignment is a no-op; the assignment is consumed either way.
    pub fn record_outcome(&self, run_id: &str, outcome: AbOutcome) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let Some(assignment) = state.assignments.remove(run_id) else {
            return;
        };

        let key = (assignment.experiment_id, assignment.variant_id);
        let accumulator = state.accumulators.entry(key).or_default();
        accumulator.count += 1;
        accumulator.total_latency_ms += outcome.latency_ms;
        accumulator.total_cost.add(outcome.cost);
        accumulator.total_output_tokens += outcome.output_tokens;
    }

    pub fn get_results(&self, experiment_id: &str) -> Option<ExperimentResults> {
        let experiment = self.experiments.iter().find(|e| e.id == experiment_id)?;
        let state = self.state.lock().ok()?;

        let variants: Vec<VariantResult> = experiment
            .variants
            .iter()
            .map(|variant| {
                let key = (experiment.id.clone(), variant.id.clone());
                let accumulator = state.accumulators.get(&key).cloned().unwrap_or_default();
                let count = accumulator.count;
                let divisor = count.max(1) as f64;
                VariantResult {
                    variant_id: variant.id.clone(),
                    count,
                    avg_latency_ms: (accumulator.total_latency_ms / divisor).round() as i64,
                    avg_cost: (accumulator.total_cost.value() / divisor * 1e6).round() / 1e6,
                    avg_output_tokens: (accumulator.total_output_tokens as f64 / divisor).round()
                        as i64,
                }
            })
            .collect();

        let min_samples = experiment.min_samples.unwrap_or(DEFAULT_MIN_SAMPLES);
        let significant = if variants.len() == 2 {
            let floor = min_samples.max(DEFAULT_MIN_SAMPLES);
            let (a, b) = (&variants[0], &variants[1]);
            if a.count >= floor && b.count >= floor {
                let (x, y) = (a.avg_latency_ms as f64, b.avg_latency_ms as f64);
                let max = x.max(y);
                max > 0.0 && (x - y).abs() / max > SIGNIFICANCE_RATIO
            } else {
                false
            }
        } else {
            false
        };

        Some(ExperimentResults {
            experiment_id: experiment.id.clone(),
            variants,
            significant,
        })
    }

    pub fn pending_assignments(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.assignments.len())
            .unwrap_or(0)
    }
}

/// 32-bit string hash `(h * 31 + ch) | 0`, computed in wrapping arithmetic.
fn hash_run_id(run_id: &str) -> u32 {
    let mut h: i32 = 0;
    for ch in run_id.chars() {
        h = h.wrapping_mul(31).wrapping_add(ch as i32);
    }
    h.unsigned_abs()
}

fn reap_expired(state: &mut AbState, now: DateTime<Utc>) {
    let cutoff = now - Duration::seconds(ASSIGNMENT_TTL);
    state
        .assignments
        .retain(|_, assignment| assignment.assigned_at >= cutoff);
    state.order.retain(|run_id| state.assignments.contains_key(run_id));
}

fn evict_to_capacity(state: &mut AbState, target: usize) {
    while state.assignments.len() > target {
        let Some(oldest) = state.order.pop_front() else {
            break;
        };
        state.assignments.remove(&oldest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AbVariantConfig;

    fn experiment(id: &str, tier: ComplexityTier, weights: &[(&str, u32)]) -> AbExperimentConfig {
        AbExperimentConfig {
            id: id.to_string(),
            tier,
            variants: weights
                .iter()
                .map(|(variant_id, weight)| AbVariantConfig {
                    id: variant_id.to_string(),
                    model: None,
                    weight: *weight,
                })
                .collect(),
            status: "active".to_string(),
            started_at: None,
            end_at: None,
            min_samples: None,
        }
    }

    fn manager(experiments: Vec<AbExperimentConfig>) -> AbTestManager {
        AbTestManager::new(&AbTestingConfig {
            enabled: true,
            experiments,
        })
        .unwrap()
    }

    #[test]
    fn construction_rejects_bad_weights() {
        let result = AbTestManager::new(&AbTestingConfig {
            enabled: true,
            experiments: vec![experiment(
                "exp",
                ComplexityTier::Mid,
                &[("a", 60), ("b", 60)],
            )],
        });
        assert!(result.is_err());
    }

    #[test]
    fn assignment_is_deterministic() {
        let m = manager(vec![experiment(
            "exp",
            ComplexityTier::Mid,
            &[("control", 50), ("treatment", 50)],
        )]);

        let first = m.assign(ComplexityTier::Mid, "run-42").unwrap();
        let second = m.assign(ComplexityTier::Mid, "run-42").unwrap();
        assert_eq!(first.variant_id, second.variant_id);
    }

    #[test]
    fn no_experiment_for_tier_means_no_assignment() {
        let m = manager(vec![experiment(
            "exp",
            ComplexityTier::Mid,
            &[("only", 100)],
        )]);
        assert!(m.assign(ComplexityTier::Reasoning, "run-1").is_none());
    }

    #[test]
    fn weights_partition_the_population() {
        let m = manager(vec![experiment(
            "exp",
            ComplexityTier::Mid,
            &[("a", 30), ("b", 70)],
        )]);

        let mut counts: HashMap<String, usize> = HashMap::new();
        for i in 0..1000 {
            let assignment = m.assign(ComplexityTier::Mid, &format!("run-{}", i)).unwrap();
            *counts.entry(assignment.variant_id).or_default() += 1;
            m.record_outcome(
                &format!("run-{}", i),
                AbOutcome {
                    latency_ms: 100.0,
                    cost: 0.001,
                    output_tokens: 10,
                },
            );
        }

        // Both variants see traffic; the split tracks the weights loosely.
        let a = counts.get("a").copied().unwrap_or(0);
        let b = counts.get("b").copied().unwrap_or(0);
        assert_eq!(a + b, 1000);
        assert!(a > 100, "variant a got {}", a);
        assert!(b > a, "expected b ({}) to dominate a ({})", b, a);
    }

    #[test]
    fn outcome_without_assignment_is_noop() {
        let m = manager(vec![experiment(
            "exp",
            ComplexityTier::Mid,
            &[("only", 100)],
        )]);
        m.record_outcome(
            "never-assigned",
            AbOutcome {
                latency_ms: 100.0,
                cost: 1.0,
                output_tokens: 5,
            },
        );

        let results = m.get_results("exp").unwrap();
        assert_eq!(results.variants[0].count, 0);
    }

    #[test]
    fn outcome_consumes_assignment() {
        let m = manager(vec![experiment(
            "exp",
            ComplexityTier::Mid,
            &[("only", 100)],
        )]);
        m.assign(ComplexityTier::Mid, "run-1").unwrap();

        let outcome = AbOutcome {
            latency_ms: 200.0,
            cost: 0.002,
            output_tokens: 50,
        };
        m.record_outcome("run-1", outcome);
        m.record_outcome("run-1", outcome); // second call must not double-count

        let results = m.get_results("exp").unwrap();
        assert_eq!(results.variants[0].count, 1);
        assert_eq!(results.variants[0].avg_latency_ms, 200);
        assert_eq!(results.variants[0].avg_output_tokens, 50);
        assert!((results.variants[0].avg_cost - 0.002).abs() < 1e-9);
    }

    #[test]
    fn pending_map_evicts_fifo_at_capacity() {
        let mut m = manager(vec![experiment(
            "exp",
            ComplexityTier::Mid,
            &[("only", 100)],
        )]);
        m.max_pending = 10;

        for i in 0..11 {
            m.assign(ComplexityTier::Mid, &format!("run-{}", i)).unwrap();
        }

        // Hitting the cap evicts down to 80% before inserting.
        assert_eq!(m.pending_assignments(), 9);

        // The oldest runs were the ones evicted.
        m.record_outcome(
            "run-0",
            AbOutcome {
                latency_ms: 1.0,
                cost: 0.0,
                output_tokens: 0,
            },
        );
        let results = m.get_results("exp").unwrap();
        assert_eq!(results.variants[0].count, 0);
    }

    #[test]
    fn significance_requires_samples_and_spread() {
        let m = manager(vec![experiment(
            "exp",
            ComplexityTier::Mid,
            &[("fast", 50), ("slow", 50)],
        )]);

        // Feed 40 outcomes per variant with a >20% latency spread.
        let mut fed = HashMap::new();
        let mut i = 0;
        while fed.get("fast").copied().unwrap_or(0) < 40
            || fed.get("slow").copied().unwrap_or(0) < 40
        {
            let run_id = format!("run-{}", i);
            i += 1;
            let Some(assignment) = m.assign(ComplexityTier::Mid, &run_id) else {
                continue;
            };
            let count = fed.entry(assignment.variant_id.clone()).or_insert(0);
            if *count >= 40 {
                // Keep pending assignments from lingering for this variant.
                m.record_outcome(
                    &run_id,
                    AbOutcome {
                        latency_ms: if assignment.variant_id == "fast" { 100.0 } else { 200.0 },
                        cost: 0.001,
                        output_tokens: 10,
                    },
                );
                continue;
            }
            *count += 1;
            m.record_outcome(
                &run_id,
                AbOutcome {
                    latency_ms: if assignment.variant_id == "fast" { 100.0 } else { 200.0 },
                    cost: 0.001,
                    output_tokens: 10,
                },
            );
        }

        let results = m.get_results("exp").unwrap();
        assert!(results.significant);
    }

    #[test]
    fn expired_experiment_assigns_nothing() {
        let mut expired = experiment("exp", ComplexityTier::Mid, &[("only", 100)]);
        expired.end_at = Some(Utc::now() - Duration::hours(1));
        let m = manager(vec![expired]);

        assert!(m.assign(ComplexityTier::Mid, "run-1").is_none());
    }

    #[test]
    fn hash_is_stable() {
        assert_eq!(hash_run_id("run-42"), hash_run_id("run-42"));
        // Matches the JS-style (h * 31 + ch) | 0 sequence.
        let mut expected: i32 = 0;
        for ch in "abc".chars() {
            expected = expected.wrapping_mul(31).wrapping_add(ch as i32);
        }
        assert_eq!(hash_run_id("abc"), expected.unsigned_abs());
    }
}
