//! SlimClaw - LLM inference optimizer and sidecar router
//!
//! Sits between an agent host and one or more LLM provider backends. For
//! each chat request it trims and summarizes conversation history, injects
//! provider cache-reuse hints, classifies the request into a complexity tier,
//! routes to a cheaper model when safe, records structured metrics, and
//! optionally forwards over an OpenAI-compatible HTTP surface.
//!
//! This library exposes the optimization pipeline directly so a host can
//! embed it without running the sidecar proxy.

pub mod ab_testing;
pub mod budget;
pub mod cache_hints;
pub mod classifier;
pub mod config;
pub mod error;
pub mod latency;
pub mod metrics;
pub mod pipeline;
pub mod pricing;
pub mod providers;
pub mod router;
pub mod server;
pub mod shadow;
pub mod tokens;
pub mod types;
pub mod windowing;

// Re-export commonly used types
pub use config::Config;
pub use error::{Result, SlimclawError};
pub use pipeline::{OptimizationPipeline, OptimizationResult};
pub use server::Server;
pub use types::*;

/// Initialize SlimClaw's tracing/logging subsystem
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "slimclaw=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
