pub mod circuit_breaker;
pub mod config;
pub mod context_engine;
pub mod error;
pub mod gateway_client;
pub mod llm;
pub mod metrics;
pub mod payload;
pub mod persistence;
pub mod queue;
pub mod rate_limit;
pub mod security;
pub mod template;
pub mod tenancy;

pub use config::Config;
pub use error::{CoreError, RateLimitScope};
