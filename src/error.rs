use thiserror::Error;

#[derive(Error, Debug)]
pub enum SlimclawError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Classification failed: {0}")]
    Classification(String),

    #[error("Routing failed: {0}")]
    Routing(String),

    #[error("Pricing refresh failed: {0}")]
    PricingRefresh(String),

    #[error("Metrics write failed: {0}")]
    ReporterWrite(String),

    #[error("Provider not available: {0}")]
    ProviderUnavailable(String),

    #[error("Upstream forward failed: {0}")]
    Forward(String),

    #[error("Upstream forward timed out after {0}ms")]
    ForwardTimeout(u64),

    #[error("Budget exceeded for tier {0}")]
    BudgetExceeded(String),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, SlimclawError>;

// Convert to HTTP response
impl axum::response::IntoResponse for SlimclawError {
    fn into_response(self) -> axum::response::Response {
        use axum::Json;
        use axum::http::StatusCode;
        use serde_json::json;

        let (status, error_message) = match self {
            SlimclawError::InvalidRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            SlimclawError::ProviderUnavailable(msg) => (StatusCode::BAD_GATEWAY, msg),
            SlimclawError::Forward(msg) => (StatusCode::BAD_GATEWAY, msg),
            SlimclawError::ForwardTimeout(ms) => (
                StatusCode::GATEWAY_TIMEOUT,
                format!("Upstream forward timed out after {}ms", ms),
            ),
            SlimclawError::BudgetExceeded(tier) => (
                StatusCode::TOO_MANY_REQUESTS,
                format!("Budget exceeded for tier {}", tier),
            ),
            SlimclawError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "message": error_message,
                "type": "api_error",
                "code": status.as_u16()
            }
        }));

        (status, body).into_response()
    }
}
