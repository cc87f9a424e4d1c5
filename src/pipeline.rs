use crate::ab_testing::{AbAssignment, AbOutcome, AbTestManager};
use crate::budget::BudgetTracker;
use crate::cache_hints::{InjectionStats, inject_breakpoints};
use crate::classifier::{self, RoutingProvider};
use crate::config::{Config, EnforcementAction};
use crate::error::Result;
use crate::latency::LatencyTracker;
use crate::metrics::MetricsCollector;
use crate::pricing::PricingCache;
use crate::router::{resolve_model, tier_model};
use crate::shadow::build_recommendation;
use crate::tokens::estimate_tokens;
use crate::types::{
    ChatMessage, ClassificationResult, ComplexityTier, OptimizationContext, OptimizerMetrics,
    OptimizerMode, RequestOutcome, RoutingDecision, ShadowRecommendation, WindowingMethod,
    WindowingOutcome,
};
use crate::windowing::{build_windowed_messages, window};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Model id that delegates model choice to the optimizer entirely.
pub const VIRTUAL_AUTO_MODEL: &str = "auto";

/// Everything the request-time optimization produced. The proxy forwards
/// `messages` to `effective_model` and reports the outcome back through
/// [`OptimizationPipeline::record_outcome`].
#[derive(Debug, Clone)]
pub struct OptimizationResult {
    pub messages: Vec<ChatMessage>,
    pub windowing: Option<WindowingOutcome>,
    pub classification: Option<ClassificationResult>,
    pub decision: Option<RoutingDecision>,
    pub shadow: Option<ShadowRecommendation>,
    pub assignment: Option<AbAssignment>,
    pub injection_stats: Option<InjectionStats>,
    pub original_token_estimate: usize,
    pub optimized_token_estimate: usize,
    pub tokens_saved: i64,
    pub effective_model: String,
    pub budget_blocked: bool,
    pub bypassed: bool,
    pub metrics_draft: OptimizerMetrics,
}

/// Request-time optimization pipeline and owner of the process-wide stores.
///
/// The optimization path is fail-open: every stage either succeeds or leaves
/// the request untouched; only the forward path surfaces errors to callers.
#[derive(Debug)]
pub struct OptimizationPipeline {
    config: Config,
    pricing: Arc<PricingCache>,
    latency: Arc<LatencyTracker>,
    budget: Arc<BudgetTracker>,
    ab_tests: Arc<AbTestManager>,
    metrics: MetricsCollector,
    routing_provider: Option<Arc<dyn RoutingProvider>>,
}

impl OptimizationPipeline {
    pub fn new(config: Config, routing_provider: Option<Arc<dyn RoutingProvider>>) -> Result<Self> {
        let pricing = Arc::new(PricingCache::new(
            config.routing.dynamic_pricing.clone(),
            config.routing.pricing.clone(),
        ));
        let latency = Arc::new(LatencyTracker::new(config.routing.latency_tracking.clone()));
        let budget = Arc::new(BudgetTracker::new(config.routing.budget.clone()));
        let ab_tests = Arc::new(AbTestManager::new(&config.routing.ab_testing)?);
        let metrics = MetricsCollector::new(config.metrics.clone());

        Ok(Self {
            config,
            pricing,
            latency,
            budget,
            ab_tests,
            metrics,
            routing_provider,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn budget(&self) -> &BudgetTracker {
        &self.budget
    }

    pub fn ab_tests(&self) -> &AbTestManager {
        &self.ab_tests
    }

    pub fn latency(&self) -> &LatencyTracker {
        &self.latency
    }

    pub fn pricing(&self) -> &PricingCache {
        &self.pricing
    }

    /// Run the optimization stages over a request.
    pub async fn optimize(
        &self,
        messages: &[ChatMessage],
        ctx: &OptimizationContext,
    ) -> OptimizationResult {
        let original_token_estimate = estimate_tokens(messages);

        if !self.config.optimizer.enabled || ctx.bypass {
            debug!(request_id = %ctx.request_id, "optimization bypassed");
            return self.passthrough(messages, ctx, original_token_estimate);
        }

        // Windowing
        let (windowing, mut working) = if self.config.windowing.enabled {
            let outcome = window(messages, &self.config.windowing);
            let rebuilt = build_windowed_messages(&outcome);
            (Some(outcome), rebuilt)
        } else {
            (None, messages.to_vec())
        };

        // Classification
        let classification = match (&self.routing_provider, self.config.routing.enabled) {
            (Some(provider), true) => {
                classifier::classify_with_router(provider.as_ref(), &working, &self.config.routing)
                    .await
            }
            _ => classifier::classify(&working),
        };

        // Routing, with budget and A/B overlays
        let mut decision = resolve_model(&classification, &self.config.routing, ctx);
        let mut budget_blocked = false;
        let mut assignment = None;

        if decision.applied {
            if let Some(guarded) = self.apply_budget_guard(&decision) {
                decision = guarded;
            } else {
                budget_blocked = true;
            }
        }
        if decision.applied && !budget_blocked {
            assignment = self.ab_tests.assign(decision.tier, &ctx.run_id);
            if let Some(model) = assignment.as_ref().and_then(|a| a.model.clone()) {
                debug!(request_id = %ctx.request_id, model, "A/B variant overrides target model");
                decision.target_model = model;
            }
        }

        let shadow = build_recommendation(
            &ctx.run_id,
            &ctx.original_model,
            &decision,
            &self.config.routing,
            &self.pricing,
        );

        // Cache breakpoints
        let injection_stats = if self.config.caching.enabled && self.config.caching.inject_breakpoints
        {
            let injected = inject_breakpoints(&working, &self.config.caching);
            working = injected.messages;
            Some(injected.stats)
        } else {
            None
        };

        let optimized_token_estimate = estimate_tokens(&working);
        let tokens_saved = original_token_estimate as i64 - optimized_token_estimate as i64;

        let effective_model = self.effective_model(ctx, &decision, budget_blocked);

        if decision.applied && effective_model == decision.target_model {
            info!(
                request_id = %ctx.request_id,
                tier = %decision.tier,
                from = %ctx.original_model,
                to = %decision.target_model,
                "🎯 routing applied"
            );
        }

        let metrics_draft = self.build_metrics_draft(
            ctx,
            messages.len(),
            windowing.as_ref(),
            Some(&classification),
            Some(&decision),
            injection_stats,
            original_token_estimate,
            optimized_token_estimate,
            tokens_saved,
        );

        OptimizationResult {
            messages: working,
            windowing,
            classification: Some(classification),
            decision: Some(decision),
            shadow: Some(shadow),
            assignment,
            injection_stats,
            original_token_estimate,
            optimized_token_estimate,
            tokens_saved,
            effective_model,
            budget_blocked,
            bypassed: false,
            metrics_draft,
        }
    }

    /// Report the completed (or failed) forward back into the trackers and
    /// record the final metrics entry. This is the only place a request's
    /// metrics reach the collector.
    pub fn record_outcome(&self, result: &OptimizationResult, ctx: &OptimizationContext, outcome: RequestOutcome) {
        let mut metrics = result.metrics_draft.clone();
        metrics.latency_ms = Some(outcome.latency_ms);
        metrics.actual_input_tokens = outcome.input_tokens;
        metrics.actual_output_tokens = outcome.output_tokens;
        metrics.cache_read_tokens = outcome.cache_read_tokens;
        metrics.cache_write_tokens = outcome.cache_write_tokens;
        if !outcome.completed {
            metrics.tokens_saved = Some(0);
            metrics.estimated_cost_saved = Some(0.0);
        }

        if outcome.completed {
            self.latency.record_latency(
                &result.effective_model,
                outcome.latency_ms as f64,
                outcome.output_tokens,
            );
        }

        let cost = self.outcome_cost(&result.effective_model, &outcome);
        if let (Some(cost), Some(decision)) = (cost, result.decision.as_ref()) {
            self.budget.record(decision.tier, cost);
        }
        self.ab_tests.record_outcome(
            &ctx.run_id,
            AbOutcome {
                latency_ms: outcome.latency_ms as f64,
                cost: cost.unwrap_or(0.0),
                output_tokens: outcome.output_tokens.unwrap_or(0),
            },
        );

        self.metrics.record(metrics);
    }

    /// Flush durable state once; called during shutdown.
    pub fn shutdown(&self) {
        self.metrics.flush();
    }

    fn passthrough(
        &self,
        messages: &[ChatMessage],
        ctx: &OptimizationContext,
        original_token_estimate: usize,
    ) -> OptimizationResult {
        let metrics_draft = self.build_metrics_draft(
            ctx,
            messages.len(),
            None,
            None,
            None,
            None,
            original_token_estimate,
            original_token_estimate,
            0,
        );

        OptimizationResult {
            messages: messages.to_vec(),
            windowing: None,
            classification: None,
            decision: None,
            shadow: None,
            assignment: None,
            injection_stats: None,
            original_token_estimate,
            optimized_token_estimate: original_token_estimate,
            tokens_saved: 0,
            effective_model: ctx.original_model.clone(),
            budget_blocked: false,
            bypassed: true,
            metrics_draft,
        }
    }

    /// Budget overlay on an applied decision. Returns the (possibly adjusted)
    /// decision, or `None` when the request must be blocked outright.
    fn apply_budget_guard(&self, decision: &RoutingDecision) -> Option<RoutingDecision> {
        if !self.budget.enabled() {
            return Some(decision.clone());
        }

        let check = self.budget.check(decision.tier);
        if check.allowed {
            return Some(decision.clone());
        }

        match self.budget.enforcement_action() {
            EnforcementAction::Block => {
                warn!(tier = %decision.tier, "budget exhausted, blocking request");
                None
            }
            EnforcementAction::Downgrade => {
                let cheaper = decision.tier.downgraded();
                warn!(
                    tier = %decision.tier,
                    downgraded_to = %cheaper,
                    "budget exhausted, routing to cheaper tier"
                );
                let mut adjusted = decision.clone();
                adjusted.target_model = tier_model(cheaper, &self.config.routing);
                if cheaper != ComplexityTier::Reasoning {
                    adjusted.thinking = None;
                }
                Some(adjusted)
            }
            EnforcementAction::AlertOnly => Some(decision.clone()),
        }
    }

    fn effective_model(
        &self,
        ctx: &OptimizationContext,
        decision: &RoutingDecision,
        budget_blocked: bool,
    ) -> String {
        if budget_blocked {
            return ctx.original_model.clone();
        }

        let virtual_auto = ctx.original_model == VIRTUAL_AUTO_MODEL
            && self.config.proxy.virtual_models.auto.enabled;
        let active = self.config.optimizer.mode == OptimizerMode::Active;

        if virtual_auto || (active && decision.applied) {
            decision.target_model.clone()
        } else {
            ctx.original_model.clone()
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_metrics_draft(
        &self,
        ctx: &OptimizationContext,
        message_count: usize,
        windowing: Option<&WindowingOutcome>,
        classification: Option<&ClassificationResult>,
        decision: Option<&RoutingDecision>,
        injection_stats: Option<InjectionStats>,
        original_token_estimate: usize,
        optimized_token_estimate: usize,
        tokens_saved: i64,
    ) -> OptimizerMetrics {
        let estimated_cost_saved = decision.map(|d| {
            let pricing = self.pricing.get_pricing(&ctx.original_model);
            (tokens_saved.max(0) as f64 / 1000.0) * pricing.input_per_1k
                + self.routing_cost_saved(d)
        });

        OptimizerMetrics {
            request_id: ctx.request_id.clone(),
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            mode: self.config.optimizer.mode,
            agent_id: ctx.agent_id.clone(),
            session_key: ctx.session_key.clone(),
            original_message_count: windowing.map_or(message_count, |w| w.original_message_count),
            windowed_message_count: windowing.map_or(message_count, |w| w.windowed_message_count),
            trimmed_messages: windowing.map_or(0, |w| w.trimmed_message_count),
            original_token_estimate,
            windowed_token_estimate: optimized_token_estimate,
            windowing_method: windowing.map_or(WindowingMethod::None, |w| w.method),
            classified_tier: classification.map(|c| c.tier),
            classification_confidence: classification.map(|c| c.confidence),
            original_model: ctx.original_model.clone(),
            target_model: decision.map_or_else(|| ctx.original_model.clone(), |d| d.target_model.clone()),
            routing_reason: decision.map(|d| d.reason),
            routing_applied: decision.is_some_and(|d| d.applied),
            cache_breakpoints_injected: injection_stats.map_or(0, |s| s.breakpoints_injected),
            actual_input_tokens: None,
            actual_output_tokens: None,
            cache_read_tokens: None,
            cache_write_tokens: None,
            latency_ms: None,
            tokens_saved: Some(tokens_saved),
            estimated_cost_saved,
        }
    }

    /// Per-1k cost difference between original and target model, scaled to
    /// the reference workload. Zero when routing kept the original model.
    fn routing_cost_saved(&self, decision: &RoutingDecision) -> f64 {
        if !decision.applied || decision.target_model == decision.original_model {
            return 0.0;
        }
        let original = self.pricing.get_pricing(&decision.original_model);
        let target = self.pricing.get_pricing(&decision.target_model);
        ((original.input_per_1k + original.output_per_1k)
            - (target.input_per_1k + target.output_per_1k))
            .max(0.0)
    }

    fn outcome_cost(&self, model: &str, outcome: &RequestOutcome) -> Option<f64> {
        let input = outcome.input_tokens?;
        let output = outcome.output_tokens?;
        let pricing = self.pricing.get_pricing(model);
        Some(
            input as f64 / 1000.0 * pricing.input_per_1k
                + output as f64 / 1000.0 * pricing.output_per_1k,
        )
    }
}
