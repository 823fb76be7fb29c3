use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::{Any, CorsLayer};
use wa_core::config::Config;
use webhook_gateway::app_state::AppState;
use webhook_gateway::handlers::{handle_webhook, healthz, metrics_endpoint, requeue_dead_letter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let config = Arc::new(Config::from_env());

    let db_pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(std::time::Duration::from_secs(config.request_timeout_seconds))
        .connect(&config.database_url)
        .await?;

    let state = AppState::new(db_pool, config.clone())?;

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let app = Router::new()
        .route("/webhook/whaticket", post(handle_webhook))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_endpoint))
        .route("/admin/dead-letter/:tenant_id/requeue", post(requeue_dead_letter))
        .layer(cors)
        .with_state(state);

    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = std::env::var("PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8090);
    let addr = SocketAddr::new(host.parse()?, port);

    tracing::info!(%addr, "starting webhook-gateway");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}
