use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use common_http_errors::ApiError;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};
use uuid::Uuid;

use wa_core::error::{CoreError, RateLimitScope};
use wa_core::payload;
use wa_core::queue::QueueJob;
use wa_core::security::hmac_verify::{validate_hmac, validate_webhook_token};
use wa_core::tenancy::{self, TenantContext};

use crate::app_state::AppState;

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
}

async fn resolve_tenant_from_headers(state: &AppState, headers: &HeaderMap) -> Result<TenantContext, CoreError> {
    let domain = tenancy::extract_domain(header_str(headers, "x-company-domain"), header_str(headers, "host"))
        .ok_or(CoreError::Tenancy)?;
    tenancy::resolve_tenant(&state.db, &domain).await
}

/// `POST /webhook/whaticket` — §4.2/§4.3/§6. Verifies the HMAC signature,
/// resolves the tenant, normalizes the payload, enforces the two
/// rate-limit checks, and enqueues the job for `message-worker`.
pub async fn handle_webhook(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let trace_id = Some(Uuid::new_v4());
    let client_ip = header_str(&headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .map(str::to_string)
        .unwrap_or_else(|| peer.ip().to_string());

    match process_webhook(&state, &headers, &body, &client_ip).await {
        Ok(company) => {
            state.metrics.record_webhook(&company, "accepted");
            (StatusCode::ACCEPTED, Json(serde_json::json!({ "queued": true }))).into_response()
        }
        Err((company, err)) => {
            state.metrics.record_webhook(&company, "rejected");
            warn!(error = %err, company, "webhook rejected");
            err.into_api_error(trace_id).into_response()
        }
    }
}

async fn process_webhook(
    state: &AppState,
    headers: &HeaderMap,
    body: &Bytes,
    client_ip: &str,
) -> Result<String, (String, CoreError)> {
    let timestamp = header_str(headers, "x-timestamp").unwrap_or_default();
    let signature = header_str(headers, "x-signature").unwrap_or_default();

    let hmac_ok = validate_hmac(&state.config.shared_secret, timestamp, body, signature, now_unix(), state.config.hmac_skew_seconds);
    if !hmac_ok {
        return Err(("unknown".to_string(), CoreError::IngressAuth));
    }
    if !validate_webhook_token(state.config.webhook_token_optional.as_deref(), header_str(headers, "x-webhook-token")) {
        return Err(("unknown".to_string(), CoreError::IngressAuth));
    }

    let tenant = resolve_tenant_from_headers(state, headers).await.map_err(|e| ("unknown".to_string(), e))?;
    let company = tenant.label.clone();

    let payload: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| (company.clone(), CoreError::IngressShape(e.to_string())))?;
    let normalized = payload::normalize(&payload).ok_or_else(|| {
        (company.clone(), CoreError::IngressShape("no number or text extracted".to_string()))
    })?;

    let ip_key = tenant.namespaced_key(&["rl", "ip", client_ip]);
    let allowed_ip = state
        .rate_limiter
        .check(&ip_key, state.config.webhook_rate_limit_ip, state.config.rate_limit_window_seconds, state.config.rate_limit_window_seconds)
        .await
        .map_err(|e| (company.clone(), CoreError::Internal(e.to_string())))?;
    if !allowed_ip {
        return Err((company, CoreError::RateLimited { scope: RateLimitScope::Ip }));
    }

    let number_key = tenant.namespaced_key(&["rl", "num", &normalized.number]);
    let allowed_number = state
        .rate_limiter
        .check(&number_key, state.config.webhook_rate_limit_number, state.config.rate_limit_window_seconds, state.config.rate_limit_window_seconds)
        .await
        .map_err(|e| (company.clone(), CoreError::Internal(e.to_string())))?;
    if !allowed_number {
        return Err((company, CoreError::RateLimited { scope: RateLimitScope::Number }));
    }

    let correlation_id = header_str(headers, "x-correlation-id").map(str::to_string).unwrap_or_else(|| Uuid::new_v4().to_string());
    let job = QueueJob::new(
        tenant.tenant_id,
        normalized.number,
        normalized.text,
        normalized.kind,
        correlation_id,
        state.config.rq_retry_max_attempts,
    );

    state
        .queue
        .enqueue(&state.config.queue_name, &job)
        .await
        .map_err(|e| (company.clone(), CoreError::IngressShape(format!("enqueue failed: {e}"))))?;

    info!(company = %company, number = %job.number, correlation_id = %job.correlation_id, "webhook accepted");
    Ok(company)
}

#[derive(serde::Serialize)]
struct DependencyStatus {
    status: &'static str,
    latency_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// `GET /healthz` — §6. Checks DB ping, cache ping, and a recent worker
/// heartbeat (< 180s old); `200 ok` only if all three pass.
pub async fn healthz(State(state): State<AppState>) -> Response {
    let mut dependencies = serde_json::Map::new();
    let mut healthy = true;

    let db_start = std::time::Instant::now();
    let (db_status, db_error) = match state.ping_db().await {
        Ok(()) => ("ok", None),
        Err(e) => {
            healthy = false;
            state.metrics.healthcheck_failures_total.with_label_values(&["database"]).inc();
            ("degraded", Some(e.to_string()))
        }
    };
    dependencies.insert(
        "database".to_string(),
        serde_json::to_value(DependencyStatus { status: db_status, latency_ms: db_start.elapsed().as_millis(), error: db_error }).unwrap(),
    );

    let cache_start = std::time::Instant::now();
    let (cache_status, cache_error) = match state.ping_cache().await {
        Ok(()) => ("ok", None),
        Err(e) => {
            healthy = false;
            state.metrics.healthcheck_failures_total.with_label_values(&["cache"]).inc();
            ("degraded", Some(e.to_string()))
        }
    };
    dependencies.insert(
        "cache".to_string(),
        serde_json::to_value(DependencyStatus { status: cache_status, latency_ms: cache_start.elapsed().as_millis(), error: cache_error }).unwrap(),
    );

    let worker_start = std::time::Instant::now();
    let (worker_status, worker_error) = match state.worker_heartbeat_age_seconds().await {
        Ok(Some(age)) if age < 180 => ("ok", None),
        Ok(Some(age)) => {
            healthy = false;
            state.metrics.healthcheck_failures_total.with_label_values(&["worker"]).inc();
            ("degraded", Some(format!("heartbeat stale: {age}s")))
        }
        Ok(None) => {
            healthy = false;
            state.metrics.healthcheck_failures_total.with_label_values(&["worker"]).inc();
            ("degraded", Some("no worker heartbeat recorded".to_string()))
        }
        Err(e) => {
            healthy = false;
            state.metrics.healthcheck_failures_total.with_label_values(&["worker"]).inc();
            ("degraded", Some(e.to_string()))
        }
    };
    dependencies.insert(
        "worker".to_string(),
        serde_json::to_value(DependencyStatus { status: worker_status, latency_ms: worker_start.elapsed().as_millis(), error: worker_error }).unwrap(),
    );

    let status_code = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    let body = serde_json::json!({
        "status": if healthy { "ok" } else { "degraded" },
        "dependencies": dependencies,
    });
    (status_code, Json(body)).into_response()
}

/// `POST /admin/dead-letter/:tenant_id/requeue` — §4.11. Pops the oldest
/// dead-lettered job for the tenant and re-enqueues it on the primary
/// queue, restricted to callers presenting `ADMIN_TOKEN` as a bearer
/// token, the same constant-time gate the webhook token check uses.
pub async fn requeue_dead_letter(
    State(state): State<AppState>,
    Path(tenant_id): Path<i64>,
    headers: HeaderMap,
) -> Response {
    let provided = header_str(&headers, "authorization").and_then(|v| v.strip_prefix("Bearer "));
    if !validate_webhook_token(state.config.admin_token.as_deref(), provided) {
        return CoreError::IngressAuth.into_api_error(Some(Uuid::new_v4())).into_response();
    }

    match state
        .queue
        .requeue_dead_letter(&state.config.queue_name, &state.config.dead_letter_queue_name, tenant_id)
        .await
    {
        Ok(Some(job)) => {
            info!(tenant_id, number = %job.number, "dead-letter job requeued");
            (StatusCode::OK, Json(serde_json::json!({ "requeued": true, "correlation_id": job.correlation_id }))).into_response()
        }
        Ok(None) => (StatusCode::NOT_FOUND, Json(serde_json::json!({ "requeued": false, "reason": "dead_letter_empty" }))).into_response(),
        Err(err) => {
            warn!(?err, tenant_id, "dead-letter requeue failed");
            CoreError::Internal(err.to_string()).into_api_error(Some(Uuid::new_v4())).into_response()
        }
    }
}

pub async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(buffer) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            buffer,
        )
            .into_response(),
        Err(err) => {
            warn!(?err, "failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_str_reads_case_insensitive_name() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Timestamp", "1700000000".parse().unwrap());
        assert_eq!(header_str(&headers, "x-timestamp"), Some("1700000000"));
    }
}
