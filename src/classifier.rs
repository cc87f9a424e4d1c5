use crate::config::RoutingConfig;
use crate::error::Result;
use crate::types::{ChatMessage, ClassificationResult, ComplexityTier};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tracing::warn;

// Keyword dictionaries per tier. Single words match whole tokens; phrases
// match as substrings of the flattened lowercase text.
const SIMPLE_KEYWORDS: &[(&str, f64)] = &[
    ("hi", 1.0),
    ("hello", 1.0),
    ("hey", 1.0),
    ("thanks", 1.0),
    ("thank you", 1.0),
    ("how are you", 1.0),
    ("define", 1.0),
    ("what is", 0.5),
    ("meaning of", 1.0),
    ("weather", 1.0),
];

const MID_KEYWORDS: &[(&str, f64)] = &[
    ("explain", 1.0),
    ("summarize", 1.0),
    ("summarise", 1.0),
    ("write", 1.0),
    ("draft", 1.0),
    ("translate", 1.0),
    ("fix", 1.0),
    ("refactor", 1.0),
    ("rename", 1.0),
    ("convert", 1.0),
    ("compare", 1.0),
    ("list", 0.5),
];

const COMPLEX_KEYWORDS: &[(&str, f64)] = &[
    ("implement", 1.5),
    ("design", 1.0),
    ("architecture", 1.5),
    ("optimize", 1.0),
    ("debug", 1.0),
    ("analyze", 1.0),
    ("migrate", 1.0),
    ("integrate", 1.0),
    ("security", 1.0),
    ("performance", 1.0),
    ("concurrency", 1.5),
    ("distributed", 1.0),
    ("algorithm", 1.0),
    ("code review", 1.0),
];

const REASONING_KEYWORDS: &[(&str, f64)] = &[
    ("prove", 2.0),
    ("proof", 2.0),
    ("theorem", 2.0),
    ("mathematically", 1.5),
    ("derive", 1.0),
    ("deduce", 1.0),
    ("step by step", 1.5),
    ("chain of thought", 1.5),
    ("logic puzzle", 1.5),
    ("riddle", 1.0),
    ("axiom", 1.5),
];

const SHORT_MESSAGE_CHARS: usize = 80;
const MEDIUM_MESSAGE_CHARS: usize = 400;
const LONG_MESSAGE_CHARS: usize = 1500;

#[derive(Debug, Clone, Default)]
pub struct StructuralSignals {
    pub has_code_blocks: bool,
    pub has_tool_calls: bool,
    pub message_length: usize,
    pub question_count: usize,
}

/// Classify a conversation into a complexity tier.
///
/// Pure and deterministic: the same message sequence always produces the same
/// result. Scores form a proper distribution with the winning tier holding
/// the maximum entry.
pub fn classify(messages: &[ChatMessage]) -> ClassificationResult {
    let text = flatten(messages);
    let has_tool_calls = messages
        .iter()
        .any(|m| m.tool_calls.as_ref().is_some_and(|t| !t.is_empty()));
    classify_text(&text, has_tool_calls)
}

/// Classify flattened text with an externally supplied tool-call flag.
pub fn classify_text(text: &str, has_tool_calls: bool) -> ClassificationResult {
    let lower = text.to_lowercase();
    let words: HashSet<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    let structural = StructuralSignals {
        has_code_blocks: lower.contains("```"),
        has_tool_calls,
        message_length: text.chars().count(),
        question_count: text.matches('?').count(),
    };

    let mut raw: HashMap<ComplexityTier, f64> = ComplexityTier::ALL
        .iter()
        .map(|t| (*t, 0.0))
        .collect();
    let mut signals = Vec::new();

    for (tier, dictionary) in [
        (ComplexityTier::Simple, SIMPLE_KEYWORDS),
        (ComplexityTier::Mid, MID_KEYWORDS),
        (ComplexityTier::Complex, COMPLEX_KEYWORDS),
        (ComplexityTier::Reasoning, REASONING_KEYWORDS),
    ] {
        for (pattern, weight) in dictionary {
            let fired = if pattern.contains(' ') {
                lower.contains(pattern)
            } else {
                words.contains(pattern)
            };
            if fired {
                *raw.get_mut(&tier).unwrap() += weight;
                signals.push(format!("keyword:{}", pattern));
            }
        }
    }

    // Structural adjustments
    if structural.has_code_blocks {
        *raw.get_mut(&ComplexityTier::Complex).unwrap() += 1.5;
        *raw.get_mut(&ComplexityTier::Mid).unwrap() += 1.0;
        signals.push("code-blocks".to_string());
    }
    if structural.has_tool_calls {
        *raw.get_mut(&ComplexityTier::Complex).unwrap() += 2.0;
        signals.push("tool-calls".to_string());
    }
    if structural.message_length < SHORT_MESSAGE_CHARS {
        *raw.get_mut(&ComplexityTier::Simple).unwrap() += 1.0;
        signals.push("short-message".to_string());
    } else if structural.message_length <= MEDIUM_MESSAGE_CHARS {
        *raw.get_mut(&ComplexityTier::Mid).unwrap() += 0.5;
        signals.push("medium-message".to_string());
    } else if structural.message_length > LONG_MESSAGE_CHARS {
        *raw.get_mut(&ComplexityTier::Complex).unwrap() += 1.0;
        signals.push("long-message".to_string());
    }
    if structural.question_count >= 2 {
        *raw.get_mut(&ComplexityTier::Complex).unwrap() += 1.0;
        signals.push(format!("questions:{}", structural.question_count));
    }

    build_result(raw, signals, "heuristic")
}

fn build_result(
    raw: HashMap<ComplexityTier, f64>,
    signals: Vec<String>,
    source: &str,
) -> ClassificationResult {
    // Shift by +1 with a small floor so every tier keeps probability mass,
    // then normalize into a distribution.
    let shifted: HashMap<ComplexityTier, f64> = raw
        .iter()
        .map(|(t, s)| (*t, (s + 1.0).max(0.01)))
        .collect();
    let total: f64 = shifted.values().sum();
    let scores: HashMap<ComplexityTier, f64> =
        shifted.iter().map(|(t, s)| (*t, s / total)).collect();

    // Argmax with the lowest tier winning ties, so degenerate input lands on
    // the cheapest tier.
    let mut tier = ComplexityTier::Simple;
    let mut first = f64::MIN;
    for candidate in ComplexityTier::ALL {
        let score = scores[&candidate];
        if score > first {
            first = score;
            tier = candidate;
        }
    }
    let second = ComplexityTier::ALL
        .iter()
        .filter(|t| **t != tier)
        .map(|t| scores[t])
        .fold(f64::MIN, f64::max);

    let confidence = ((0.5 + (first - second)).clamp(0.0, 1.0) * 100.0).round() / 100.0;

    let reason = format!(
        "{} classification: {} (score {:.2}, {} signal{})",
        source,
        tier,
        first,
        signals.len(),
        if signals.len() == 1 { "" } else { "s" }
    );

    ClassificationResult {
        tier,
        confidence,
        scores,
        signals,
        reason,
    }
}

fn flatten(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| m.content.text())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Capability consumed by the router-backed classifier. The model router
/// depends on the classifier, never the other way around; an external routing
/// engine plugs in through this seam.
#[async_trait]
pub trait RoutingProvider: Send + Sync + std::fmt::Debug {
    async fn route(
        &self,
        text: &str,
        context_tokens: usize,
        cfg: &RoutingConfig,
    ) -> Result<RouteHint>;
}

#[derive(Debug, Clone)]
pub struct RouteHint {
    pub model: Option<String>,
    pub tier: ComplexityTier,
    pub confidence: f64,
    pub savings: Option<f64>,
    pub cost_estimate: Option<f64>,
}

/// Router-backed classification. Falls back to the heuristic classifier when
/// the routing provider is unavailable or returns garbage.
pub async fn classify_with_router(
    provider: &dyn RoutingProvider,
    messages: &[ChatMessage],
    cfg: &RoutingConfig,
) -> ClassificationResult {
    let text = flatten(messages);
    let context_tokens = crate::tokens::estimate_tokens(messages);

    match provider.route(&text, context_tokens, cfg).await {
        Ok(hint) => hint_to_result(hint),
        Err(e) => {
            warn!("routing provider failed, falling back to heuristic: {}", e);
            classify(messages)
        }
    }
}

fn hint_to_result(hint: RouteHint) -> ClassificationResult {
    // Reconstruct a distribution around the hinted tier. The winner keeps at
    // least 0.4 so it stays the argmax over three equal remainders.
    let confidence = hint.confidence.clamp(0.0, 1.0);
    let winner = confidence.max(0.4);
    let rest = (1.0 - winner) / 3.0;

    let scores: HashMap<ComplexityTier, f64> = ComplexityTier::ALL
        .iter()
        .map(|t| (*t, if *t == hint.tier { winner } else { rest }))
        .collect();

    let mut signals = vec!["router".to_string()];
    if let Some(model) = &hint.model {
        signals.push(format!("router-model:{}", model));
    }

    ClassificationResult {
        tier: hint.tier,
        confidence: (confidence * 100.0).round() / 100.0,
        scores,
        signals,
        reason: format!("router classification: {} ({:.2})", hint.tier, confidence),
    }
}
