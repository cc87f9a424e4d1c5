use crate::{
    config::Config,
    error::{Result, SlimclawError},
    pipeline::{OptimizationPipeline, OptimizationResult},
    providers::{CredentialMap, ProviderCredentials, resolve_provider},
    types::*,
};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, Method, StatusCode, header},
    response::Response,
    routing::{get, post},
};
use futures::StreamExt;
use std::{collections::HashMap, sync::Arc, time::Duration, time::Instant};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use uuid::Uuid;

pub struct Server {
    config: Config,
    state: Arc<ProxyState>,
}

struct ProxyState {
    config: Config,
    pipeline: Arc<OptimizationPipeline>,
    credentials: CredentialMap,
    client: reqwest::Client,
}

impl Server {
    pub fn new(config: Config) -> Result<Self> {
        let pipeline = Arc::new(OptimizationPipeline::new(config.clone(), None)?);
        Self::with_pipeline(config, pipeline)
    }

    pub fn with_pipeline(config: Config, pipeline: Arc<OptimizationPipeline>) -> Result<Self> {
        let credentials = CredentialMap::from_config(&config.proxy);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.proxy.request_timeout_ms))
            .build()?;

        let state = Arc::new(ProxyState {
            config: config.clone(),
            pipeline,
            credentials,
            client,
        });

        Ok(Self { config, state })
    }

    pub async fn start(self) -> Result<()> {
        let app = self.create_app();
        let addr = format!("{}:{}", self.config.proxy.bind, self.config.proxy.port);

        let flush_timer = self.state.pipeline.metrics().start_flush_timer();

        info!("🚀 SlimClaw sidecar listening on {}", addr);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        // Final flush before exit; the pricing/flush timers die with us.
        flush_timer.abort();
        self.state.pipeline.shutdown();
        info!("SlimClaw sidecar stopped");
        Ok(())
    }

    pub fn create_app(&self) -> Router {
        Router::new()
            .route("/health", get(health_check))
            .route("/v1/chat/completions", post(chat_completions))
            .route("/slimclaw/stats", get(optimizer_stats))
            .route("/slimclaw/budget", get(budget_status))
            .route("/slimclaw/experiments/:id", get(experiment_results))
            .route("/slimclaw/latency/:model", get(latency_stats))
            .layer(TraceLayer::new_for_http())
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                    .allow_headers(Any),
            )
            .with_state(Arc::clone(&self.state))
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received, draining in-flight requests");
}

// Route handlers

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "OK",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "slimclaw",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn optimizer_stats(State(state): State<Arc<ProxyState>>) -> Json<serde_json::Value> {
    let stats = state.pipeline.metrics().get_stats();
    Json(serde_json::to_value(stats).unwrap_or_default())
}

async fn budget_status(State(state): State<Arc<ProxyState>>) -> Json<serde_json::Value> {
    let status = state.pipeline.budget().get_status();
    Json(serde_json::json!({ "tiers": status }))
}

async fn experiment_results(
    State(state): State<Arc<ProxyState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    match state.pipeline.ab_tests().get_results(&id) {
        Some(results) => Ok(Json(serde_json::to_value(results)?)),
        None => Err(SlimclawError::InvalidRequest(format!(
            "unknown experiment: {}",
            id
        ))),
    }
}

async fn latency_stats(
    State(state): State<Arc<ProxyState>>,
    Path(model): Path<String>,
) -> Json<serde_json::Value> {
    match state.pipeline.latency().get_latency_stats(&model) {
        Some(stats) => Json(serde_json::to_value(stats).unwrap_or_default()),
        None => Json(serde_json::json!({ "model": model, "count": 0 })),
    }
}

async fn chat_completions(
    State(state): State<Arc<ProxyState>>,
    request: axum::http::Request<Body>,
) -> Result<Response> {
    let started = Instant::now();
    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| SlimclawError::InvalidRequest(format!("failed to read request body: {}", e)))?;

    let chat_request: ChatCompletionRequest = serde_json::from_slice(&bytes)
        .map_err(|e| SlimclawError::InvalidRequest(format!("invalid JSON: {}", e)))?;

    let request_id = Uuid::new_v4().simple().to_string();
    let ctx = build_context(&request_id, &chat_request.model, &parts.headers);

    let result = state.pipeline.optimize(&chat_request.messages, &ctx).await;

    if result.budget_blocked {
        let tier = result
            .decision
            .as_ref()
            .map(|d| d.tier.to_string())
            .unwrap_or_default();
        return Err(SlimclawError::BudgetExceeded(tier));
    }

    let debug_headers = build_debug_headers(&state.config, &ctx, &result);

    // Resolve the target provider's credentials
    let resolution = resolve_provider(&result.effective_model, &state.config.routing.tier_providers);
    let Some(credentials) = state.credentials.get(&resolution.provider) else {
        record_failure(&state, &result, &ctx, started);
        return Err(SlimclawError::ProviderUnavailable(format!(
            "no credentials for provider {}",
            resolution.provider
        )));
    };

    let forward_body = build_forward_body(&chat_request, &result);
    let upstream = forward(
        &state,
        credentials,
        &resolution.provider,
        &forward_body,
        started,
    )
    .await;

    let response = match upstream {
        Ok(response) => response,
        Err(e) => {
            record_failure(&state, &result, &ctx, started);
            return Err(e);
        }
    };

    relay_response(state, response, result, ctx, started, debug_headers).await
}

fn build_context(request_id: &str, model: &str, headers: &HeaderMap) -> OptimizationContext {
    let mut header_map = HashMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            header_map.insert(name.as_str().to_string(), value.to_string());
        }
    }

    let run_id = header_map
        .get("x-slimclaw-run-id")
        .cloned()
        .unwrap_or_else(|| request_id.to_string());
    let bypass = header_map
        .get("x-slimclaw-bypass")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    OptimizationContext {
        request_id: request_id.to_string(),
        run_id,
        original_model: model.to_string(),
        session_key: header_map.get("x-slimclaw-session-key").cloned(),
        agent_id: header_map.get("x-slimclaw-agent-id").cloned(),
        headers: header_map,
        bypass,
    }
}

/// Rebuild the upstream body: optimized messages, the routed model, and the
/// thinking budget when the decision was applied. Everything else is carried
/// over verbatim.
fn build_forward_body(
    request: &ChatCompletionRequest,
    result: &OptimizationResult,
) -> ChatCompletionRequest {
    let mut forward = request.clone();
    forward.messages = result.messages.clone();
    forward.model = result.effective_model.clone();

    if let Some(decision) = &result.decision {
        if result.effective_model == decision.target_model {
            if let Some(thinking) = decision.thinking {
                if let Ok(value) = serde_json::to_value(thinking) {
                    forward.extra.insert("thinking".to_string(), value);
                }
            }
        }
    }

    forward
}

async fn forward(
    state: &Arc<ProxyState>,
    credentials: &ProviderCredentials,
    provider: &str,
    body: &ChatCompletionRequest,
    started: Instant,
) -> Result<reqwest::Response> {
    let url = format!("{}/v1/chat/completions", credentials.base_url);
    let timeout_ms = state.config.proxy.request_timeout_ms;

    let send = |model_override: Option<&str>| {
        let mut body = body.clone();
        if let Some(model) = model_override {
            body.model = model.to_string();
        }
        let mut request = state
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", credentials.api_key),
            )
            .json(&body);
        if provider == "openrouter" {
            request = request
                .header(
                    "HTTP-Referer",
                    &state.config.routing.open_router_headers.http_referer,
                )
                .header("X-Title", &state.config.routing.open_router_headers.x_title);
        }
        request.send()
    };

    let deadline = Duration::from_millis(timeout_ms).saturating_sub(started.elapsed());
    let first = tokio::time::timeout(deadline, send(None)).await;

    match first {
        Err(_) => Err(SlimclawError::ForwardTimeout(timeout_ms)),
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            if !state.config.proxy.retry_on_error {
                return Err(SlimclawError::Forward(e.to_string()));
            }
            warn!("forward failed, retrying once: {}", e);
            let fallback = state.config.proxy.fallback_model.as_deref();
            let deadline = Duration::from_millis(timeout_ms).saturating_sub(started.elapsed());
            match tokio::time::timeout(deadline, send(fallback)).await {
                Err(_) => Err(SlimclawError::ForwardTimeout(timeout_ms)),
                Ok(Ok(response)) => Ok(response),
                Ok(Err(e)) => Err(SlimclawError::Forward(e.to_string())),
            }
        }
    }
}

/// Stream or buffer the upstream response back to the caller, preserving
/// status and content type, then report the outcome into the trackers.
async fn relay_response(
    state: Arc<ProxyState>,
    response: reqwest::Response,
    result: OptimizationResult,
    ctx: OptimizationContext,
    started: Instant,
    debug_headers: Vec<(String, String)>,
) -> Result<Response> {
    let status = StatusCode::from_u16(response.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();
    let streaming = content_type.starts_with("text/event-stream");

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, &content_type);
    for (name, value) in &debug_headers {
        builder = builder.header(name.as_str(), value.as_str());
    }

    if streaming {
        // Pass the SSE stream through verbatim. Token usage is not extracted
        // from streams; the outcome records latency to first byte only.
        let latency_ms = started.elapsed().as_millis() as u64;
        state.pipeline.record_outcome(
            &result,
            &ctx,
            RequestOutcome {
                latency_ms,
                completed: true,
                ..RequestOutcome::default()
            },
        );

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| std::io::Error::other(e)));
        let body = Body::from_stream(stream);
        return builder
            .body(body)
            .map_err(|e| SlimclawError::Forward(e.to_string()));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| SlimclawError::Forward(e.to_string()))?;
    let latency_ms = started.elapsed().as_millis() as u64;

    let usage = extract_usage(&bytes);
    state.pipeline.record_outcome(
        &result,
        &ctx,
        RequestOutcome {
            latency_ms,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_read_tokens: usage.cache_read_tokens,
            cache_write_tokens: None,
            completed: status.is_success(),
        },
    );

    builder = builder.header("X-SlimClaw-Latency-Ms", latency_ms.to_string());
    builder
        .body(Body::from(bytes))
        .map_err(|e| SlimclawError::Forward(e.to_string()))
}

#[derive(Debug, Default)]
struct ExtractedUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    cache_read_tokens: Option<u64>,
}

fn extract_usage(bytes: &[u8]) -> ExtractedUsage {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(bytes) else {
        return ExtractedUsage::default();
    };
    let usage = &value["usage"];
    ExtractedUsage {
        input_tokens: usage["prompt_tokens"].as_u64(),
        output_tokens: usage["completion_tokens"].as_u64(),
        cache_read_tokens: usage["prompt_tokens_details"]["cached_tokens"].as_u64(),
    }
}

fn build_debug_headers(
    config: &Config,
    ctx: &OptimizationContext,
    result: &OptimizationResult,
) -> Vec<(String, String)> {
    let enabled = config.optimizer.enabled && !result.bypassed;
    let savings_percent = if result.original_token_estimate > 0 {
        (result.tokens_saved.max(0) as f64 / result.original_token_estimate as f64 * 10000.0)
            .round()
            / 100.0
    } else {
        0.0
    };

    let windowing_applied = result
        .windowing
        .as_ref()
        .is_some_and(|w| w.method != WindowingMethod::None);
    let caching_applied = result
        .injection_stats
        .is_some_and(|s| s.breakpoints_injected > 0);
    let routing_applied = result
        .decision
        .as_ref()
        .is_some_and(|d| d.applied && result.effective_model == d.target_model);

    let mut headers = vec![
        ("X-SlimClaw-Request-Id".to_string(), ctx.request_id.clone()),
        ("X-SlimClaw-Enabled".to_string(), enabled.to_string()),
        (
            "X-SlimClaw-Mode".to_string(),
            config.optimizer.mode.as_str().to_string(),
        ),
        (
            "X-SlimClaw-Original-Tokens".to_string(),
            result.original_token_estimate.to_string(),
        ),
        (
            "X-SlimClaw-Optimized-Tokens".to_string(),
            result.optimized_token_estimate.to_string(),
        ),
        (
            "X-SlimClaw-Tokens-Saved".to_string(),
            result.tokens_saved.to_string(),
        ),
        (
            "X-SlimClaw-Savings-Percent".to_string(),
            format!("{:.2}", savings_percent),
        ),
        (
            "X-SlimClaw-Windowing".to_string(),
            applied_or_skipped(windowing_applied),
        ),
        (
            "X-SlimClaw-Caching".to_string(),
            applied_or_skipped(caching_applied),
        ),
        (
            "X-SlimClaw-Routing".to_string(),
            applied_or_skipped(routing_applied),
        ),
    ];

    if let Some(classification) = &result.classification {
        headers.push((
            "X-SlimClaw-Classification".to_string(),
            classification.tier.to_string(),
        ));
    }
    if let Some(windowing) = &result.windowing {
        if windowing.trimmed_message_count > 0 {
            headers.push((
                "X-SlimClaw-Trimmed-Messages".to_string(),
                windowing.trimmed_message_count.to_string(),
            ));
        }
    }
    if let Some(stats) = result.injection_stats {
        if stats.breakpoints_injected > 0 {
            headers.push((
                "X-SlimClaw-Cache-Breakpoints".to_string(),
                stats.breakpoints_injected.to_string(),
            ));
        }
    }
    if let Some(agent_id) = &ctx.agent_id {
        headers.push(("X-SlimClaw-Agent-Id".to_string(), agent_id.clone()));
    }
    if let Some(session_key) = &ctx.session_key {
        headers.push(("X-SlimClaw-Session-Key".to_string(), session_key.clone()));
    }

    headers
}

fn applied_or_skipped(applied: bool) -> String {
    if applied { "applied" } else { "skipped" }.to_string()
}

fn record_failure(
    state: &Arc<ProxyState>,
    result: &OptimizationResult,
    ctx: &OptimizationContext,
    started: Instant,
) {
    state.pipeline.record_outcome(
        result,
        ctx,
        RequestOutcome {
            latency_ms: started.elapsed().as_millis() as u64,
            completed: false,
            ..RequestOutcome::default()
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RouteReason, RoutingDecision};

    // A hand-built result so header and body logic can be exercised without
    // a live upstream.
    fn sample_result(tokens_saved: i64) -> OptimizationResult {
        let decision = RoutingDecision {
            original_model: "anthropic/claude-sonnet-4-20250514".to_string(),
            target_model: "anthropic/claude-3-haiku-20240307".to_string(),
            tier: ComplexityTier::Simple,
            confidence: 0.9,
            reason: RouteReason::Routed,
            thinking: None,
            applied: true,
        };
        OptimizationResult {
            messages: vec![ChatMessage::new("user", "hi")],
            windowing: None,
            classification: None,
            decision: Some(decision),
            shadow: None,
            assignment: None,
            injection_stats: None,
            original_token_estimate: 1000,
            optimized_token_estimate: (1000 - tokens_saved).max(0) as usize,
            tokens_saved,
            effective_model: "anthropic/claude-sonnet-4-20250514".to_string(),
            budget_blocked: false,
            bypassed: false,
            metrics_draft: sample_metrics(),
        }
    }

    fn sample_ctx() -> OptimizationContext {
        OptimizationContext {
            request_id: "req-1".to_string(),
            run_id: "run-1".to_string(),
            original_model: "anthropic/claude-sonnet-4-20250514".to_string(),
            headers: HashMap::new(),
            session_key: Some("sess-9".to_string()),
            agent_id: None,
            bypass: false,
        }
    }

    fn sample_metrics() -> OptimizerMetrics {
        OptimizerMetrics {
            request_id: "req-1".to_string(),
            timestamp: "2026-02-19T10:00:00Z".to_string(),
            mode: OptimizerMode::Shadow,
            agent_id: None,
            session_key: None,
            original_message_count: 1,
            windowed_message_count: 1,
            trimmed_messages: 0,
            original_token_estimate: 1000,
            windowed_token_estimate: 900,
            windowing_method: WindowingMethod::None,
            classified_tier: None,
            classification_confidence: None,
            original_model: "m".to_string(),
            target_model: "m".to_string(),
            routing_reason: None,
            routing_applied: false,
            cache_breakpoints_injected: 0,
            actual_input_tokens: None,
            actual_output_tokens: None,
            cache_read_tokens: None,
            cache_write_tokens: None,
            latency_ms: None,
            tokens_saved: None,
            estimated_cost_saved: None,
        }
    }

    #[test]
    fn debug_headers_cover_the_contract() {
        let config = Config::default();
        let ctx = sample_ctx();
        let result = sample_result(100);

        let headers = build_debug_headers(&config, &ctx, &result);
        let map: HashMap<&str, &str> = headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        assert_eq!(map["X-SlimClaw-Request-Id"], "req-1");
        assert_eq!(map["X-SlimClaw-Enabled"], "true");
        assert_eq!(map["X-SlimClaw-Mode"], "shadow");
        assert_eq!(map["X-SlimClaw-Original-Tokens"], "1000");
        assert_eq!(map["X-SlimClaw-Optimized-Tokens"], "900");
        assert_eq!(map["X-SlimClaw-Tokens-Saved"], "100");
        assert_eq!(map["X-SlimClaw-Savings-Percent"], "10.00");
        assert_eq!(map["X-SlimClaw-Windowing"], "skipped");
        assert_eq!(map["X-SlimClaw-Caching"], "skipped");
        // Shadow mode: decision applied but effective model is the original.
        assert_eq!(map["X-SlimClaw-Routing"], "skipped");
        assert_eq!(map["X-SlimClaw-Session-Key"], "sess-9");
        assert!(!map.contains_key("X-SlimClaw-Agent-Id"));
    }

    #[test]
    fn bypass_header_is_parsed() {
        let mut headers = HeaderMap::new();
        headers.insert("x-slimclaw-bypass", "true".parse().unwrap());
        headers.insert("x-slimclaw-agent-id", "agent-1".parse().unwrap());

        let ctx = build_context("req-1", "gpt-4o", &headers);
        assert!(ctx.bypass);
        assert_eq!(ctx.agent_id.as_deref(), Some("agent-1"));
        assert_eq!(ctx.run_id, "req-1");
    }

    #[test]
    fn run_id_header_overrides_request_id() {
        let mut headers = HeaderMap::new();
        headers.insert("x-slimclaw-run-id", "external-run".parse().unwrap());

        let ctx = build_context("req-1", "gpt-4o", &headers);
        assert_eq!(ctx.run_id, "external-run");
    }

    #[test]
    fn forward_body_rewrites_model_and_messages() {
        let raw = serde_json::json!({
            "model": "anthropic/claude-sonnet-4-20250514",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.2
        });
        let request: ChatCompletionRequest = serde_json::from_value(raw).unwrap();

        let mut result = sample_result(0);
        result.effective_model = "anthropic/claude-3-haiku-20240307".to_string();

        let forward = build_forward_body(&request, &result);
        assert_eq!(forward.model, "anthropic/claude-3-haiku-20240307");
        assert_eq!(
            forward.extra.get("temperature").and_then(|v| v.as_f64()),
            Some(0.2)
        );
    }

    #[test]
    fn thinking_is_attached_when_routing_applied() {
        let raw = serde_json::json!({
            "model": "openai/o3",
            "messages": [{"role": "user", "content": "prove it"}]
        });
        let request: ChatCompletionRequest = serde_json::from_value(raw).unwrap();

        let mut result = sample_result(0);
        let decision = result.decision.as_mut().unwrap();
        decision.target_model = "openai/o3".to_string();
        decision.thinking = Some(ThinkingConfig {
            budget_tokens: 10000,
        });
        result.effective_model = "openai/o3".to_string();

        let forward = build_forward_body(&request, &result);
        assert_eq!(
            forward.extra.get("thinking"),
            Some(&serde_json::json!({"budget_tokens": 10000}))
        );
    }

    #[test]
    fn usage_extraction_reads_openai_shape() {
        let body = serde_json::json!({
            "usage": {
                "prompt_tokens": 120,
                "completion_tokens": 80,
                "prompt_tokens_details": {"cached_tokens": 64}
            }
        });
        let usage = extract_usage(body.to_string().as_bytes());
        assert_eq!(usage.input_tokens, Some(120));
        assert_eq!(usage.output_tokens, Some(80));
        assert_eq!(usage.cache_read_tokens, Some(64));
    }

    #[test]
    fn usage_extraction_tolerates_garbage() {
        let usage = extract_usage(b"not json at all");
        assert!(usage.input_tokens.is_none());
        assert!(usage.output_tokens.is_none());
    }
}
