use crate::config::RoutingConfig;
use crate::types::{
    ClassificationResult, ComplexityTier, OptimizationContext, RouteReason, RoutingDecision,
    ThinkingConfig,
};
use tracing::debug;

/// Request header that forces a specific target model.
pub const PINNED_MODEL_HEADER: &str = "x-model-pinned";

const DEFAULT_SIMPLE_MODEL: &str = "anthropic/claude-3-haiku-20240307";
const DEFAULT_MID_MODEL: &str = "anthropic/claude-sonnet-4-20250514";
const DEFAULT_COMPLEX_MODEL: &str = "anthropic/claude-opus-4-20250514";
const DEFAULT_REASONING_MODEL: &str = "openai/o3";

/// Configured model for a tier, or the built-in default.
pub fn tier_model(tier: ComplexityTier, cfg: &RoutingConfig) -> String {
    cfg.tiers
        .get(tier)
        .filter(|m| !m.is_empty())
        .unwrap_or(match tier {
            ComplexityTier::Simple => DEFAULT_SIMPLE_MODEL,
            ComplexityTier::Mid => DEFAULT_MID_MODEL,
            ComplexityTier::Complex => DEFAULT_COMPLEX_MODEL,
            ComplexityTier::Reasoning => DEFAULT_REASONING_MODEL,
        })
        .to_string()
}

/// Infer the complexity tier a model name belongs to. Used by the downgrade
/// guard; unknown models are assumed expensive.
pub fn infer_tier_from_model(model: &str) -> ComplexityTier {
    let name = model.to_lowercase();

    if name.contains("o3") || name.contains("o4-mini") || name.contains("r1")
        || name.contains("gemini-2.5-pro")
    {
        return ComplexityTier::Reasoning;
    }
    // "mini" must not fire for gemini-* or the OpenAI o-series minis
    if name.contains("haiku")
        || name.contains("nano")
        || (name.contains("mini") && !name.contains("gemini") && !name.contains("o-mini"))
        || name.contains("v3")
    {
        return ComplexityTier::Simple;
    }
    if name.contains("sonnet")
        || name.contains("flash")
        || name.contains("llama-4-")
        || name.contains("qwen3-coder")
    {
        return ComplexityTier::Mid;
    }
    if name.contains("opus")
        || (name.contains("gpt-4.1") && !name.contains("mini") && !name.contains("nano"))
        || (name.contains("gpt-4") && !name.contains("turbo"))
    {
        return ComplexityTier::Complex;
    }

    ComplexityTier::Complex
}

/// Resolve a routing decision from a classification and the request context.
///
/// Override precedence, first match wins: header pin, config pin, low
/// confidence, routing disabled, tier mapping. Infallible: anything that
/// cannot be resolved degrades to passthrough.
pub fn resolve_model(
    classification: &ClassificationResult,
    cfg: &RoutingConfig,
    ctx: &OptimizationContext,
) -> RoutingDecision {
    let tier = classification.tier;
    let confidence = classification.confidence;
    let thinking = thinking_for(tier, cfg);

    let decide = |target: String, reason: RouteReason| RoutingDecision {
        original_model: ctx.original_model.clone(),
        target_model: target,
        tier,
        confidence,
        reason,
        thinking,
        applied: reason == RouteReason::Routed,
    };

    // 1. Pinned by header
    if let Some(pinned) = ctx.header(PINNED_MODEL_HEADER) {
        if !pinned.is_empty() {
            debug!(model = pinned, "request pinned by header");
            return decide(pinned.to_string(), RouteReason::Pinned);
        }
    }

    // 2. Pinned by config
    if cfg
        .pinned_models
        .iter()
        .any(|m| m == &ctx.original_model)
    {
        return decide(ctx.original_model.clone(), RouteReason::Pinned);
    }

    // 3. Low confidence
    if confidence < cfg.min_confidence {
        return decide(ctx.original_model.clone(), RouteReason::LowConfidence);
    }

    // 4. Routing disabled
    if !cfg.enabled {
        return decide(ctx.original_model.clone(), RouteReason::RoutingDisabled);
    }

    // 5. Tier mapping, subject to the downgrade guard
    if !cfg.allow_downgrade && !ctx.original_model.is_empty() {
        let original_tier = infer_tier_from_model(&ctx.original_model);
        if tier < original_tier {
            debug!(
                original = %ctx.original_model,
                classified = %tier,
                inferred = %original_tier,
                "downgrade guard kept original model"
            );
            return decide(ctx.original_model.clone(), RouteReason::Pinned);
        }
    }

    decide(tier_model(tier, cfg), RouteReason::Routed)
}

fn thinking_for(tier: ComplexityTier, cfg: &RoutingConfig) -> Option<ThinkingConfig> {
    (tier == ComplexityTier::Reasoning).then(|| ThinkingConfig {
        budget_tokens: cfg.reasoning_budget,
    })
}
