use std::time::Duration;

use rand::Rng;
use redis::AsyncCommands;
use serde_json::json;

use crate::security::sanitize::sanitize_for_log;

#[derive(Debug, thiserror::Error)]
#[error("whaticket error: status={status:?} retryable={retryable} {message}")]
pub struct WhaticketError {
    pub retryable: bool,
    pub status: Option<u16>,
    pub message: String,
}

impl WhaticketError {
    fn retryable(status: Option<u16>, message: impl Into<String>) -> Self {
        Self { retryable: true, status, message: message.into() }
    }

    fn permanent(status: Option<u16>, message: impl Into<String>) -> Self {
        Self { retryable: false, status, message: message.into() }
    }

    pub fn sanitized_reason(&self) -> String {
        let reason = sanitize_for_log(&self.message);
        truncate_chars(&reason, 256)
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub enum MediaType {
    Image,
    Video,
    Document,
    Audio,
}

impl MediaType {
    fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Video => "video",
            MediaType::Document => "document",
            MediaType::Audio => "audio",
        }
    }
}

enum Auth {
    Bearer(String),
    Jwt { email: String, password: String },
}

/// Sends outbound messages through the upstream gateway with bearer or
/// JWT auth, classifying failures as retryable/permanent and retrying
/// transient ones with jittered backoff. Grounded on
/// `app/services/whaticket.py::WhaticketClient`.
pub struct GatewayClient {
    http: reqwest::Client,
    base_url: String,
    auth: Auth,
    redis: redis::Client,
    jwt_cache_key: String,
    retry_attempts: u32,
}

impl GatewayClient {
    pub fn with_bearer_token(base_url: String, token: String, redis_url: &str, retry_attempts: u32) -> anyhow::Result<Self> {
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            auth: Auth::Bearer(token),
            redis: redis::Client::open(redis_url)?,
            jwt_cache_key: "whaticket:jwt".to_string(),
            retry_attempts,
        })
    }

    pub fn with_jwt_login(
        base_url: String,
        email: String,
        password: String,
        redis_url: &str,
        retry_attempts: u32,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            auth: Auth::Jwt { email, password },
            redis: redis::Client::open(redis_url)?,
            jwt_cache_key: "whaticket:jwt".to_string(),
            retry_attempts,
        })
    }

    /// Tenant-scoped JWT cache key override, so multiple tenants sharing
    /// one gateway credential pool don't clobber each other's tokens.
    pub fn scoped_to(mut self, tenant_cache_key: String) -> Self {
        self.jwt_cache_key = tenant_cache_key;
        self
    }

    async fn bearer_token(&self) -> anyhow::Result<String> {
        match &self.auth {
            Auth::Bearer(token) => Ok(token.clone()),
            Auth::Jwt { email, password } => {
                let mut conn = self.redis.get_multiplexed_async_connection().await?;
                if let Some(cached) = conn.get::<_, Option<String>>(&self.jwt_cache_key).await? {
                    return Ok(cached);
                }
                let login_url = format!("{}/auth/login", self.base_url.trim_end_matches('/'));
                let body = json!({ "email": email, "password": password });
                let response: serde_json::Value = self.http.post(login_url).json(&body).send().await?.json().await?;
                let token = response
                    .get("token")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow::anyhow!("whaticket login response missing token"))?
                    .to_string();
                let expires_in = response.get("expiresIn").and_then(|v| v.as_i64()).unwrap_or(3600);
                let ttl = (expires_in - 60).max(1) as u64;
                let _: () = conn.set_ex(&self.jwt_cache_key, &token, ttl).await?;
                Ok(token)
            }
        }
    }

    fn classify_status(status: reqwest::StatusCode, body_snippet: String) -> WhaticketError {
        if status.is_server_error() {
            WhaticketError::retryable(Some(status.as_u16()), body_snippet)
        } else {
            WhaticketError::permanent(Some(status.as_u16()), body_snippet)
        }
    }

    async fn send_once(&self, payload: serde_json::Value) -> Result<Option<String>, WhaticketError> {
        let token = self
            .bearer_token()
            .await
            .map_err(|e| WhaticketError::retryable(None, e.to_string()))?;

        let response = self
            .http
            .post(&self.base_url)
            .bearer_auth(&token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| WhaticketError::retryable(None, e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let value: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);
            let id = value
                .get("id")
                .and_then(|v| v.as_str().map(str::to_string).or_else(|| v.as_i64().map(|n| n.to_string())));
            Ok(id)
        } else {
            let snippet = response.text().await.unwrap_or_default();
            Err(Self::classify_status(status, snippet))
        }
    }

    async fn send_with_retry(&self, payload: serde_json::Value) -> Result<Option<String>, WhaticketError> {
        let mut last_error = None;
        for attempt in 1..=self.retry_attempts.max(1) {
            match self.send_once(payload.clone()).await {
                Ok(id) => return Ok(id),
                Err(err) if !err.retryable => return Err(err),
                Err(err) => {
                    last_error = Some(err);
                    if attempt < self.retry_attempts {
                        let backoff = jittered_backoff_millis(attempt);
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| WhaticketError::retryable(None, "retries exhausted".into())))
    }

    /// Sends a plain text message; retries `retryable=true` failures up to
    /// `retry_attempts`, matching `send_text`.
    pub async fn send_text(&self, number: &str, body: &str) -> Result<Option<String>, WhaticketError> {
        self.send_with_retry(json!({ "number": number, "body": body })).await
    }

    pub async fn send_media(
        &self,
        number: &str,
        media_url: &str,
        caption: Option<&str>,
        media_type: MediaType,
    ) -> Result<Option<String>, WhaticketError> {
        self.send_with_retry(json!({
            "number": number,
            "mediaUrl": media_url,
            "mediaType": media_type.as_str(),
            "body": caption.unwrap_or_default(),
        }))
        .await
    }
}

fn jittered_backoff_millis(attempt: u32) -> u64 {
    let base = 2u64.saturating_pow(attempt).saturating_mul(100).min(10_000);
    let jitter = rand::thread_rng().gen_range(0..=base / 2);
    base + jitter
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn classifies_5xx_as_retryable() {
        let err = GatewayClient::classify_status(StatusCode::BAD_GATEWAY, "boom".into());
        assert!(err.retryable);
        assert_eq!(err.status, Some(502));
    }

    #[test]
    fn classifies_4xx_as_permanent() {
        let err = GatewayClient::classify_status(StatusCode::BAD_REQUEST, "bad request".into());
        assert!(!err.retryable);
    }

    #[test]
    fn sanitized_reason_redacts_and_truncates() {
        let err = WhaticketError::permanent(Some(400), format!("Authorization: Bearer {}", "x".repeat(300)));
        let sanitized = err.sanitized_reason();
        assert!(!sanitized.contains(&"x".repeat(300)));
        assert!(sanitized.chars().count() <= 256);
    }

    #[test]
    fn backoff_grows_with_attempt() {
        assert!(jittered_backoff_millis(1) < jittered_backoff_millis(6));
    }
}
