use common_http_errors::ApiError;
use uuid::Uuid;

/// Domain error kinds, one per §7 of the spec. `webhook-gateway` maps these
/// to the HTTP contract via `into_api_error`; `message-worker` matches on
/// them directly to decide retry vs dead-letter routing.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid signature or token")]
    IngressAuth,
    #[error("invalid payload: {0}")]
    IngressShape(String),
    #[error("unknown tenant domain")]
    Tenancy,
    #[error("rate limited: {scope}")]
    RateLimited { scope: RateLimitScope },
    #[error("llm call failed: {0}")]
    Llm(String),
    #[error("gateway send failed: {message}")]
    Gateway { retryable: bool, status: Option<u16>, message: String },
    #[error("persistence failure: {0}")]
    Persistence(#[from] sqlx::Error),
    #[error("cache failure: {0}")]
    Cache(#[from] redis::RedisError),
    #[error("internal failure: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitScope {
    Ip,
    Number,
}

impl std::fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateLimitScope::Ip => write!(f, "ip"),
            RateLimitScope::Number => write!(f, "number"),
        }
    }
}

impl CoreError {
    pub fn into_api_error(self, trace_id: Option<Uuid>) -> ApiError {
        match self {
            CoreError::IngressAuth => ApiError::Unauthorized { code: "invalid_signature", trace_id },
            CoreError::IngressShape(_) => ApiError::BadRequest { code: "invalid_payload", trace_id, message: None },
            CoreError::Tenancy => ApiError::NotFound { code: "company_not_found", trace_id },
            CoreError::RateLimited { scope: RateLimitScope::Ip } => {
                ApiError::TooManyRequests { code: "too_many_requests_ip", trace_id }
            }
            CoreError::RateLimited { scope: RateLimitScope::Number } => {
                ApiError::TooManyRequests { code: "too_many_requests_number", trace_id }
            }
            other => ApiError::internal(other, trace_id),
        }
    }
}
