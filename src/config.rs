use crate::error::{Result, SlimclawError};
use crate::types::{ComplexityTier, OptimizerMode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub windowing: WindowingConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub caching: CachingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_mode")]
    pub mode: OptimizerMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_summarize_threshold")]
    pub summarize_threshold: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub allow_downgrade: bool,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default)]
    pub pinned_models: Vec<String>,
    #[serde(default)]
    pub tiers: TierModels,
    #[serde(default)]
    pub tier_providers: HashMap<String, String>,
    #[serde(default = "default_reasoning_budget")]
    pub reasoning_budget: u32,
    #[serde(default)]
    pub open_router_headers: OpenRouterHeaders,
    /// Static per-model price overrides, per 1k tokens.
    #[serde(default)]
    pub pricing: HashMap<String, StaticPrice>,
    #[serde(default)]
    pub dynamic_pricing: DynamicPricingConfig,
    #[serde(default)]
    pub latency_tracking: LatencyTrackingConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub ab_testing: AbTestingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TierModels {
    #[serde(default)]
    pub simple: Option<String>,
    #[serde(default)]
    pub mid: Option<String>,
    #[serde(default)]
    pub complex: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

impl TierModels {
    pub fn get(&self, tier: ComplexityTier) -> Option<&str> {
        match tier {
            ComplexityTier::Simple => self.simple.as_deref(),
            ComplexityTier::Mid => self.mid.as_deref(),
            ComplexityTier::Complex => self.complex.as_deref(),
            ComplexityTier::Reasoning => self.reasoning.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterHeaders {
    #[serde(default = "default_referer")]
    pub http_referer: String,
    #[serde(default = "default_title")]
    pub x_title: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StaticPrice {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicPricingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_pricing_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default = "default_pricing_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_pricing_api_url")]
    pub api_url: String,
    #[serde(default = "default_relevant_providers")]
    pub relevant_providers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyTrackingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_latency_buffer")]
    pub buffer_size: usize,
    #[serde(default = "default_outlier_threshold")]
    pub outlier_threshold_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Per-tier daily limits in USD. Absent or zero means unlimited.
    #[serde(default)]
    pub daily: HashMap<ComplexityTier, f64>,
    #[serde(default)]
    pub weekly: HashMap<ComplexityTier, f64>,
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold_percent: f64,
    #[serde(default)]
    pub enforcement_action: EnforcementAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EnforcementAction {
    Downgrade,
    Block,
    #[default]
    AlertOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AbTestingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub experiments: Vec<AbExperimentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbExperimentConfig {
    pub id: String,
    pub tier: ComplexityTier,
    pub variants: Vec<AbVariantConfig>,
    #[serde(default = "default_experiment_status")]
    pub status: String,
    #[serde(default)]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub end_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub min_samples: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbVariantConfig {
    pub id: String,
    #[serde(default)]
    pub model: Option<String>,
    pub weight: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub inject_breakpoints: bool,
    #[serde(default = "default_min_content_length")]
    pub min_content_length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_base_dir")]
    pub base_dir: String,
    #[serde(default = "default_log_path")]
    pub log_path: String,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_ring_buffer_size")]
    pub ring_buffer_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_api")]
    pub default_api: String,
    #[serde(default)]
    pub virtual_models: VirtualModelsConfig,
    #[serde(default)]
    pub provider_overrides: HashMap<String, ProviderOverride>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub retry_on_error: bool,
    #[serde(default)]
    pub fallback_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualModelsConfig {
    #[serde(default)]
    pub auto: VirtualModelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualModelConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderOverride {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

// Default values
fn default_true() -> bool {
    true
}

fn default_mode() -> OptimizerMode {
    OptimizerMode::Shadow
}

fn default_max_messages() -> usize {
    10
}

fn default_max_tokens() -> usize {
    4000
}

fn default_summarize_threshold() -> usize {
    8
}

fn default_min_confidence() -> f64 {
    0.4
}

fn default_reasoning_budget() -> u32 {
    10000
}

fn default_referer() -> String {
    "slimclaw".to_string()
}

fn default_title() -> String {
    "SlimClaw".to_string()
}

fn default_pricing_ttl_ms() -> u64 {
    6 * 60 * 60 * 1000 // 6 hours
}

fn default_pricing_timeout_ms() -> u64 {
    10_000
}

fn default_pricing_api_url() -> String {
    "https://openrouter.ai/api/v1/models".to_string()
}

fn default_relevant_providers() -> Vec<String> {
    [
        "anthropic",
        "openai",
        "google",
        "meta-llama",
        "qwen",
        "deepseek",
        "mistralai",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_latency_buffer() -> usize {
    100
}

fn default_outlier_threshold() -> f64 {
    60_000.0
}

fn default_alert_threshold() -> f64 {
    80.0
}

fn default_experiment_status() -> String {
    "active".to_string()
}

fn default_min_content_length() -> usize {
    1000
}

fn default_base_dir() -> String {
    ".slimclaw".to_string()
}

fn default_log_path() -> String {
    "metrics".to_string()
}

fn default_flush_interval_ms() -> u64 {
    10_000
}

fn default_ring_buffer_size() -> usize {
    1000
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3334
}

fn default_api() -> String {
    "openai-completions".to_string()
}

fn default_request_timeout_ms() -> u64 {
    120_000
}

const MAX_LATENCY_BUFFER: usize = 1000;

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: OptimizerMode::Shadow,
        }
    }
}

impl Default for WindowingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_messages: default_max_messages(),
            max_tokens: default_max_tokens(),
            summarize_threshold: default_summarize_threshold(),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_downgrade: true,
            min_confidence: default_min_confidence(),
            pinned_models: Vec::new(),
            tiers: TierModels::default(),
            tier_providers: HashMap::new(),
            reasoning_budget: default_reasoning_budget(),
            open_router_headers: OpenRouterHeaders::default(),
            pricing: HashMap::new(),
            dynamic_pricing: DynamicPricingConfig::default(),
            latency_tracking: LatencyTrackingConfig::default(),
            budget: BudgetConfig::default(),
            ab_testing: AbTestingConfig::default(),
        }
    }
}

impl Default for OpenRouterHeaders {
    fn default() -> Self {
        Self {
            http_referer: default_referer(),
            x_title: default_title(),
        }
    }
}

impl Default for DynamicPricingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_ms: default_pricing_ttl_ms(),
            timeout_ms: default_pricing_timeout_ms(),
            api_url: default_pricing_api_url(),
            relevant_providers: default_relevant_providers(),
        }
    }
}

impl Default for LatencyTrackingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            buffer_size: default_latency_buffer(),
            outlier_threshold_ms: default_outlier_threshold(),
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            daily: HashMap::new(),
            weekly: HashMap::new(),
            alert_threshold_percent: default_alert_threshold(),
            enforcement_action: EnforcementAction::AlertOnly,
        }
    }
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            inject_breakpoints: true,
            min_content_length: default_min_content_length(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_dir: default_base_dir(),
            log_path: default_log_path(),
            flush_interval_ms: default_flush_interval_ms(),
            ring_buffer_size: default_ring_buffer_size(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_bind(),
            port: default_port(),
            default_api: default_api(),
            virtual_models: VirtualModelsConfig::default(),
            provider_overrides: HashMap::new(),
            request_timeout_ms: default_request_timeout_ms(),
            retry_on_error: false,
            fallback_model: None,
        }
    }
}

impl Default for VirtualModelsConfig {
    fn default() -> Self {
        Self {
            auto: VirtualModelConfig { enabled: true },
        }
    }
}

impl Default for VirtualModelConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        use std::fs;

        let mut config = if let Ok(content) = fs::read_to_string(path) {
            toml::from_str::<Config>(&content)?
        } else {
            Config::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(bind) = std::env::var("SLIMCLAW_BIND") {
            self.proxy.bind = bind;
        }
        if let Ok(port) = std::env::var("SLIMCLAW_PORT") {
            if let Ok(port_num) = port.parse() {
                self.proxy.port = port_num;
            }
        }
        if let Ok(mode) = std::env::var("SLIMCLAW_MODE") {
            match mode.as_str() {
                "shadow" => self.optimizer.mode = OptimizerMode::Shadow,
                "active" => self.optimizer.mode = OptimizerMode::Active,
                _ => {}
            }
        }
        if let Ok(url) = std::env::var("SLIMCLAW_PRICING_API_URL") {
            self.routing.dynamic_pricing.api_url = url;
        }

        // Inline provider keys; *_API_KEY env names referenced via api_key_env
        // are resolved later by the credential map.
        for (provider, var) in [
            ("openrouter", "SLIMCLAW_OPENROUTER_API_KEY"),
            ("openai", "SLIMCLAW_OPENAI_API_KEY"),
            ("anthropic", "SLIMCLAW_ANTHROPIC_API_KEY"),
            ("google", "SLIMCLAW_GOOGLE_API_KEY"),
        ] {
            if let Ok(api_key) = std::env::var(var) {
                self.proxy
                    .provider_overrides
                    .entry(provider.to_string())
                    .or_default()
                    .api_key = Some(api_key);
            }
        }
    }

    /// Single validation pass, run once at construction.
    pub fn validate(&self) -> Result<()> {
        if self.proxy.port < 1024 {
            return Err(SlimclawError::Config(format!(
                "proxy.port must be in [1024, 65535], got {}",
                self.proxy.port
            )));
        }
        if self.windowing.max_messages < 2 {
            return Err(SlimclawError::Config(format!(
                "windowing.max_messages must be >= 2, got {}",
                self.windowing.max_messages
            )));
        }
        if self.windowing.max_tokens < 500 {
            return Err(SlimclawError::Config(format!(
                "windowing.max_tokens must be >= 500, got {}",
                self.windowing.max_tokens
            )));
        }
        if self.windowing.summarize_threshold < 2 {
            return Err(SlimclawError::Config(format!(
                "windowing.summarize_threshold must be >= 2, got {}",
                self.windowing.summarize_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.routing.min_confidence) {
            return Err(SlimclawError::Config(format!(
                "routing.min_confidence must be in [0, 1], got {}",
                self.routing.min_confidence
            )));
        }
        if self.routing.latency_tracking.buffer_size == 0
            || self.routing.latency_tracking.buffer_size > MAX_LATENCY_BUFFER
        {
            return Err(SlimclawError::Config(format!(
                "routing.latency_tracking.buffer_size must be in [1, {}], got {}",
                MAX_LATENCY_BUFFER, self.routing.latency_tracking.buffer_size
            )));
        }
        if !matches!(
            self.proxy.default_api.as_str(),
            "openai-completions" | "anthropic-messages"
        ) {
            return Err(SlimclawError::Config(format!(
                "proxy.default_api must be openai-completions or anthropic-messages, got {}",
                self.proxy.default_api
            )));
        }

        for experiment in &self.routing.ab_testing.experiments {
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

        Ok(())
    }
}
