use crate::circuit_breaker::CircuitBreaker;
use crate::security::sanitize::detect_prompt_injection;
use rand::Rng;
use serde_json::json;
use std::time::Duration;

pub const PROMPT_INJECTION_REPLY: &str = "Desculpe, não posso executar esse tipo de comando.";

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("circuit breaker open")]
    CircuitOpen,
    #[error("llm request failed: {0}")]
    Request(String),
    #[error("llm response malformed")]
    MalformedResponse,
}

#[derive(Debug, Clone)]
pub struct ConversationTurn {
    pub role: String,
    pub body: String,
}

/// Outcome of `generate_reply`: either a genuine LLM completion or the
/// canned injection-guard reply, which the caller must treat as a normal
/// reply rather than an error (property 10, §8).
pub enum LlmOutcome {
    Reply(String),
    InjectionBlocked,
}

pub struct LlmClient {
    http: reqwest::Client,
    api_key: String,
    retry_attempts: u32,
    timeout: Duration,
}

impl LlmClient {
    pub fn new(api_key: String, retry_attempts: u32, timeout_seconds: u64) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(Duration::from_secs(timeout_seconds)).build()?;
        Ok(Self { http, api_key, retry_attempts, timeout: Duration::from_secs(timeout_seconds) })
    }

    fn assemble_prompt(system_prompt: &str, context: &[ConversationTurn], max_messages: usize, user_text: &str) -> String {
        let mut lines = vec![system_prompt.to_string()];
        let tail = if context.len() > max_messages { &context[context.len() - max_messages..] } else { context };
        for turn in tail {
            lines.push(format!("{}: {}", turn.role, turn.body));
        }
        lines.push(format!("user: {}", user_text));
        lines.join("\n")
    }

    async fn post_once(&self, prompt: &str) -> Result<String, LlmError> {
        let url = "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:generateContent";
        let body = json!({ "contents": [{ "parts": [{ "text": prompt }] }] });
        let response = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LlmError::Request(format!("status {}", response.status())));
        }

        let value: serde_json::Value = response.json().await.map_err(|_| LlmError::MalformedResponse)?;
        value
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or(LlmError::MalformedResponse)
    }

    /// Circuit-breaker check → injection guard → assembled-prompt POST with
    /// jittered-exponential retry, matching `generate_reply` in
    /// `app/services/llm.py`. The retry loop itself is re-expressed as an
    /// explicit jittered backoff (the original used `tenacity`); the
    /// teacher has no retry primitive of its own to reuse here.
    pub async fn generate_reply(
        &self,
        breaker: &CircuitBreaker,
        user_text: &str,
        system_prompt: &str,
        context: &[ConversationTurn],
        context_max_messages: usize,
    ) -> Result<LlmOutcome, LlmError> {
        if !breaker.allow().await.map_err(|e| LlmError::Request(e.to_string()))? {
            return Err(LlmError::CircuitOpen);
        }

        if detect_prompt_injection(user_text) {
            return Ok(LlmOutcome::InjectionBlocked);
        }

        let prompt = Self::assemble_prompt(system_prompt, context, context_max_messages, user_text);

        let mut last_error = None;
        for attempt in 1..=self.retry_attempts {
            match tokio::time::timeout(self.timeout, self.post_once(&prompt)).await {
                Ok(Ok(text)) => {
                    breaker.record_success().await.map_err(|e| LlmError::Request(e.to_string()))?;
                    return Ok(LlmOutcome::Reply(text));
                }
                Ok(Err(err)) => last_error = Some(err),
                Err(_) => last_error = Some(LlmError::Request("timeout".into())),
            }
            breaker.record_failure().await.map_err(|e| LlmError::Request(e.to_string()))?;
            if attempt < self.retry_attempts {
                let backoff = jittered_backoff_millis(attempt);
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
        }
        Err(last_error.unwrap_or(LlmError::Request("exhausted retries".into())))
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

    #[test]
    fn assembles_system_prompt_then_trailing_context_then_new_user_message() {
        let context = vec![
            ConversationTurn { role: "user".into(), body: "oi".into() },
            ConversationTurn { role: "assistant".into(), body: "olá!".into() },
            ConversationTurn { role: "user".into(), body: "tudo bem?".into() },
        ];
        let prompt = LlmClient::assemble_prompt("system rules", &context, 2, "e o prazo de entrega?");
        assert_eq!(prompt, "system rules\nassistant: olá!\nuser: tudo bem?\nuser: e o prazo de entrega?");
    }

    #[test]
    fn backoff_grows_with_attempt_number() {
        assert!(jittered_backoff_millis(1) < jittered_backoff_millis(5));
    }
}
