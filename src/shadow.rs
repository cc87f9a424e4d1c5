use crate::config::RoutingConfig;
use crate::pricing::PricingCache;
use crate::providers::resolve_provider;
use crate::types::{CostDelta, RoutingDecision, ShadowRecommendation};
use std::collections::HashMap;

/// Build the what-we-would-do record for a request, independent of whether
/// the routing decision was applied.
///
/// The cost delta uses a reference workload of 1k input plus 1k output
/// tokens, so `cost(m) = input_per_1k(m) + output_per_1k(m)`.
pub fn build_recommendation(
    run_id: &str,
    actual_model: &str,
    decision: &RoutingDecision,
    cfg: &RoutingConfig,
    pricing: &PricingCache,
) -> ShadowRecommendation {
    let recommended_model = decision.target_model.clone();
    let resolution = resolve_provider(&recommended_model, &cfg.tier_providers);

    let actual = pricing.get_pricing(actual_model);
    let recommended = pricing.get_pricing(&recommended_model);

    let actual_cost_per_1k = actual.input_per_1k + actual.output_per_1k;
    let recommended_cost_per_1k = recommended.input_per_1k + recommended.output_per_1k;

    let savings_percent = if actual_model == recommended_model || actual_cost_per_1k <= 0.0 {
        0.0
    } else {
        let raw = (actual_cost_per_1k - recommended_cost_per_1k) / actual_cost_per_1k * 100.0;
        (raw.max(0.0) * 100.0).round() / 100.0
    };

    let mut recommended_headers = HashMap::new();
    if resolution.provider == "openrouter" {
        recommended_headers.insert(
            "HTTP-Referer".to_string(),
            cfg.open_router_headers.http_referer.clone(),
        );
        recommended_headers.insert("X-Title".to_string(), cfg.open_router_headers.x_title.clone());
    }

    ShadowRecommendation {
        run_id: run_id.to_string(),
        timestamp: chrono::Utc::now(),
        actual_model: actual_model.to_string(),
        recommended_model,
        recommended_provider: resolution.provider,
        decision: decision.clone(),
        cost_delta: CostDelta {
            actual_cost_per_1k,
            recommended_cost_per_1k,
            savings_percent,
        },
        recommended_headers,
        recommended_thinking: decision.thinking,
        would_apply: decision.applied,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DynamicPricingConfig;
    use crate::types::{ComplexityTier, RouteReason};

    fn pricing() -> PricingCache {
        PricingCache::new(DynamicPricingConfig::default(), HashMap::new())
    }

    fn decision(target: &str, reason: RouteReason) -> RoutingDecision {
        RoutingDecision {
            original_model: "anthropic/claude-opus-4-20250514".to_string(),
            target_model: target.to_string(),
            tier: ComplexityTier::Simple,
            confidence: 0.9,
            reason,
            thinking: None,
            applied: reason == RouteReason::Routed,
        }
    }

    #[test]
    fn cheaper_recommendation_has_positive_savings() {
        let cfg = RoutingConfig::default();
        let recommendation = build_recommendation(
            "run-1",
            "anthropic/claude-opus-4-20250514",
            &decision("anthropic/claude-3-haiku-20240307", RouteReason::Routed),
            &cfg,
            &pricing(),
        );

        // opus 0.09/1k vs haiku 0.0015/1k
        assert!(recommendation.cost_delta.savings_percent > 95.0);
        assert!(recommendation.would_apply);
        assert_eq!(recommendation.recommended_provider, "anthropic");
    }

    #[test]
    fn same_model_has_zero_savings() {
        let cfg = RoutingConfig::default();
        let recommendation = build_recommendation(
            "run-1",
            "anthropic/claude-opus-4-20250514",
            &decision("anthropic/claude-opus-4-20250514", RouteReason::Pinned),
            &cfg,
            &pricing(),
        );

        assert_eq!(recommendation.cost_delta.savings_percent, 0.0);
        assert!(!recommendation.would_apply);
    }

    #[test]
    fn more_expensive_recommendation_clamps_to_zero() {
        let cfg = RoutingConfig::default();
        let recommendation = build_recommendation(
            "run-1",
            "anthropic/claude-3-haiku-20240307",
            &decision("anthropic/claude-opus-4-20250514", RouteReason::Routed),
            &cfg,
            &pricing(),
        );

        assert_eq!(recommendation.cost_delta.savings_percent, 0.0);
    }

    #[test]
    fn openrouter_recommendations_carry_headers() {
        let mut cfg = RoutingConfig::default();
        cfg.tier_providers
            .insert("anthropic/*".to_string(), "openrouter".to_string());

        let recommendation = build_recommendation(
            "run-1",
            "anthropic/claude-opus-4-20250514",
            &decision("anthropic/claude-3-haiku-20240307", RouteReason::Routed),
            &cfg,
            &pricing(),
        );

        assert_eq!(
            recommendation.recommended_headers.get("HTTP-Referer").map(String::as_str),
            Some("slimclaw")
        );
        assert_eq!(
            recommendation.recommended_headers.get("X-Title").map(String::as_str),
            Some("SlimClaw")
        );
    }
}
