use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// OpenAI-compatible chat completion request. Unrecognized fields are kept in
// `extra` so the forwarded body stays byte-faithful to the caller's intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: MessageContent::Text(content.to_string()),
            name: None,
            cache_control: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

/// Marker telling a provider the prefix up to this message is cacheable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheControl {
    #[serde(rename = "type")]
    pub control_type: String,
}

impl CacheControl {
    pub fn ephemeral() -> Self {
        Self {
            control_type: "ephemeral".to_string(),
        }
    }
}

/// Message content: either a bare string or an ordered block sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// One structured content block, `{type, text?, ...}`.
///
/// The optimizer only ever reads the `text` payload; whatever else a block
/// carries (image data, tool results, provider extensions) rides along in
/// `rest` and is re-serialized unchanged when the message is forwarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

impl ContentBlock {
    pub fn text(text: &str) -> Self {
        Self {
            block_type: "text".to_string(),
            text: Some(text.to_string()),
            rest: serde_json::Map::new(),
        }
    }
}

impl MessageContent {
    /// Flattened textual payload. Blocks contribute only their `text` field,
    /// in order; everything else is ignored.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => {
                let mut flat = String::new();
                for text in blocks.iter().filter_map(|b| b.text.as_deref()) {
                    if !flat.is_empty() {
                        flat.push(' ');
                    }
                    flat.push_str(text);
                }
                flat
            }
        }
    }

    pub fn len(&self) -> usize {
        self.text().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Display for MessageContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.text())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    pub arguments: String,
}

/// Complexity bucket a request is placed into. Ordered: a "higher" tier maps
/// to a more capable (and more expensive) model.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityTier {
    Simple,
    Mid,
    Complex,
    Reasoning,
}

impl ComplexityTier {
    pub const ALL: [ComplexityTier; 4] = [
        ComplexityTier::Simple,
        ComplexityTier::Mid,
        ComplexityTier::Complex,
        ComplexityTier::Reasoning,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComplexityTier::Simple => "simple",
            ComplexityTier::Mid => "mid",
            ComplexityTier::Complex => "complex",
            ComplexityTier::Reasoning => "reasoning",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "simple" => Some(ComplexityTier::Simple),
            "mid" => Some(ComplexityTier::Mid),
            "complex" => Some(ComplexityTier::Complex),
            "reasoning" => Some(ComplexityTier::Reasoning),
            _ => None,
        }
    }

    /// The next-cheaper tier, saturating at `Simple`.
    pub fn downgraded(&self) -> Self {
        match self {
            ComplexityTier::Simple | ComplexityTier::Mid => ComplexityTier::Simple,
            ComplexityTier::Complex => ComplexityTier::Mid,
            ComplexityTier::Reasoning => ComplexityTier::Complex,
        }
    }
}

impl std::fmt::Display for ComplexityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub tier: ComplexityTier,
    pub confidence: f64,
    pub scores: HashMap<ComplexityTier, f64>,
    pub signals: Vec<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouteReason {
    Routed,
    Pinned,
    LowConfidence,
    RoutingDisabled,
}

impl RouteReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteReason::Routed => "routed",
            RouteReason::Pinned => "pinned",
            RouteReason::LowConfidence => "low-confidence",
            RouteReason::RoutingDisabled => "routing-disabled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThinkingConfig {
    pub budget_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub original_model: String,
    pub target_model: String,
    pub tier: ComplexityTier,
    pub confidence: f64,
    pub reason: RouteReason,
    #[serde(default)]
    pub thinking: Option<ThinkingConfig>,
    pub applied: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowingMethod {
    None,
    Heuristic,
    Llm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowingOutcome {
    pub system_prompt: String,
    #[serde(default)]
    pub context_summary: Option<String>,
    pub recent_messages: Vec<ChatMessage>,
    pub original_message_count: usize,
    pub windowed_message_count: usize,
    pub trimmed_message_count: usize,
    pub original_token_estimate: usize,
    pub windowed_token_estimate: usize,
    pub summary_token_estimate: usize,
    pub method: WindowingMethod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerMode {
    Shadow,
    Active,
}

impl OptimizerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizerMode::Shadow => "shadow",
            OptimizerMode::Active => "active",
        }
    }
}

/// Per-request context handed to the pipeline by the host or the proxy.
#[derive(Debug, Clone, Default)]
pub struct OptimizationContext {
    pub request_id: String,
    pub run_id: String,
    pub original_model: String,
    pub headers: HashMap<String, String>,
    pub session_key: Option<String>,
    pub agent_id: Option<String>,
    pub bypass: bool,
}

impl OptimizationContext {
    /// Case-insensitive header lookup (keys are stored lowercased by the proxy,
    /// but host embedders may pass arbitrary casing).
    pub fn header(&self, name: &str) -> Option<&str> {
        let lower = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k.to_ascii_lowercase() == lower)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
    pub fetched_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostDelta {
    pub actual_cost_per_1k: f64,
    pub recommended_cost_per_1k: f64,
    pub savings_percent: f64,
}

/// Full what-we-would-do record, produced for every request independent of
/// whether the routing decision was applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowRecommendation {
    pub run_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub actual_model: String,
    pub recommended_model: String,
    pub recommended_provider: String,
    pub decision: RoutingDecision,
    pub cost_delta: CostDelta,
    pub recommended_headers: HashMap<String, String>,
    #[serde(default)]
    pub recommended_thinking: Option<ThinkingConfig>,
    pub would_apply: bool,
}

/// Flat per-request metrics record. Numeric fields unknown at construction
/// stay `None` and serialize as explicit nulls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerMetrics {
    pub request_id: String,
    pub timestamp: String,
    pub mode: OptimizerMode,
    pub agent_id: Option<String>,
    pub session_key: Option<String>,
    pub original_message_count: usize,
    pub windowed_message_count: usize,
    pub trimmed_messages: usize,
    pub original_token_estimate: usize,
    pub windowed_token_estimate: usize,
    pub windowing_method: WindowingMethod,
    pub classified_tier: Option<ComplexityTier>,
    pub classification_confidence: Option<f64>,
    pub original_model: String,
    pub target_model: String,
    pub routing_reason: Option<RouteReason>,
    pub routing_applied: bool,
    pub cache_breakpoints_injected: usize,
    pub actual_input_tokens: Option<u64>,
    pub actual_output_tokens: Option<u64>,
    pub cache_read_tokens: Option<u64>,
    pub cache_write_tokens: Option<u64>,
    pub latency_ms: Option<u64>,
    pub tokens_saved: Option<i64>,
    pub estimated_cost_saved: Option<f64>,
}

/// Post-response measurements reported back into the pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOutcome {
    pub latency_ms: u64,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub cache_read_tokens: Option<u64>,
    pub cache_write_tokens: Option<u64>,
    pub completed: bool,
}
