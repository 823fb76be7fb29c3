use std::sync::Arc;
use std::time::Instant;

use sqlx::PgPool;

use wa_core::circuit_breaker::CircuitBreaker;
use wa_core::config::Config;
use wa_core::context_engine::{ContextEngine, RuntimeContext};
use wa_core::gateway_client::GatewayClient;
use wa_core::llm::{ConversationTurn, LlmClient, LlmOutcome, PROMPT_INJECTION_REPLY};
use wa_core::metrics::WaMetrics;
use wa_core::persistence;
use wa_core::queue::{QueueGateway, QueueJob};
use wa_core::security::sanitize::{detect_prompt_injection, sanitize_text};
use wa_core::template::TemplateSet;
use wa_core::tenancy;

const SANITIZED_TEXT_MAX_CHARS: usize = 1000;

/// What happened to a dequeued job, used by the poll loop to decide whether
/// to immediately pull the next job or back off.
pub enum JobOutcome {
    Sent,
    RetryScheduled,
    DeadLettered,
}

/// Orchestrates one job through §4.9, steps 1-8: sanitize, build context,
/// produce a reply (LLM, injection guard, or `ai_disabled`), send, persist,
/// and dead-letter on permanent failure. Grounded on
/// `app/services/tasks.py::process_message`.
pub struct Worker {
    pub db: PgPool,
    pub config: Arc<Config>,
    pub metrics: Arc<WaMetrics>,
    pub context_engine: Arc<ContextEngine>,
    pub llm: Arc<LlmClient>,
    pub gateway: Arc<GatewayClient>,
    pub queue: Arc<QueueGateway>,
    pub templates: Arc<TemplateSet>,
    pub redis_url: String,
}

impl Worker {
    pub async fn process(&self, mut job: QueueJob) -> anyhow::Result<JobOutcome> {
        let started = Instant::now();
        job.attempt += 1;

        let tenant = match tenancy::resolve_tenant_by_id(&self.db, job.tenant_id).await {
            Ok(tenant) => tenant,
            Err(err) => {
                tracing::warn!(tenant_id = job.tenant_id, error = %err, "could not resolve tenant for job, dead-lettering");
                self.dead_letter(&mut job, "unknown tenant").await?;
                self.metrics.task_latency_seconds.observe(started.elapsed().as_secs_f64());
                return Ok(JobOutcome::DeadLettered);
            }
        };

        let sanitized_text = sanitize_text(&job.text, SANITIZED_TEXT_MAX_CHARS);
        let runtime = self.context_engine.build(&tenant, &job.number, &sanitized_text, &self.templates).await?;

        let final_message = self.produce_reply(&tenant, &job, &sanitized_text, &runtime).await;

        // Computed in memory only; never written to the history cache until
        // the send below actually succeeds (§4.9 step 6).
        let updated_history =
            ContextEngine::merge_history(runtime.history.clone(), &sanitized_text, &final_message, &runtime.personalization);

        match self.gateway.send_text(&job.number, &final_message).await {
            Ok(external_id) => {
                self.metrics.whaticket_send_success_total.inc();
                self.context_engine.cache_history(&tenant, &job.number, &updated_history).await?;
                self.persist_success(&tenant, &job, &final_message, external_id.as_deref(), &updated_history, &runtime, &sanitized_text)
                    .await?;
                self.metrics.task_latency_seconds.observe(started.elapsed().as_secs_f64());
                Ok(JobOutcome::Sent)
            }
            Err(gateway_err) => {
                self.metrics.whaticket_errors_total.inc();
                let reason = gateway_err.sanitized_reason();
                let permanent = !gateway_err.retryable || job.retries_exhausted();
                let status = if permanent { "FAILED_PERMANENT" } else { "FAILED_TEMPORARY" };

                persistence::persist_failure(&self.db, tenant.tenant_id, &job.number, &final_message, status, None, Some(&reason)).await?;

                let outcome = if permanent {
                    self.dead_letter(&mut job, &reason).await?;
                    JobOutcome::DeadLettered
                } else {
                    self.metrics.whaticket_send_retry_total.inc();
                    let delay = self.config.retry_delay_seconds(job.attempt);
                    self.queue.schedule_retry(&self.config.queue_name, &job, delay).await?;
                    JobOutcome::RetryScheduled
                };
                self.metrics.task_latency_seconds.observe(started.elapsed().as_secs_f64());
                Ok(outcome)
            }
        }
    }

    /// Step 3: injection guard first, then `ai_disabled`, then the LLM —
    /// each branch resolves to `final_message`, never an error, matching
    /// "the caller treats this as a normal reply" (§4.6).
    async fn produce_reply(&self, tenant: &tenancy::TenantContext, job: &QueueJob, sanitized_text: &str, runtime: &RuntimeContext) -> String {
        let mut vars = runtime.template_vars.clone();

        if detect_prompt_injection(sanitized_text) {
            self.metrics.llm_prompt_injection_blocked_total.inc();
            return PROMPT_INJECTION_REPLY.to_string();
        }

        if !runtime.ai_enabled {
            let (body, _) = self.templates.render_or_fallback("ai_disabled", &vars);
            return body;
        }

        let breaker_key = tenant.namespaced_key(&["llm", "circuit"]);
        let breaker = match CircuitBreaker::new(&self.redis_url, breaker_key, self.config.llm_circuit_breaker_threshold, self.config.llm_circuit_breaker_reset_seconds) {
            Ok(breaker) => breaker,
            Err(err) => {
                tracing::warn!(error = %err, "failed to construct circuit breaker, treating llm call as failed");
                let (body, _) = self.templates.render_or_fallback("technical_issue", &vars);
                return body;
            }
        };

        let context_turns: Vec<ConversationTurn> =
            runtime.history.iter().map(|turn| ConversationTurn { role: turn.role.clone(), body: turn.body.clone() }).collect();

        let llm_start = Instant::now();
        let outcome = self
            .llm
            .generate_reply(&breaker, sanitized_text, &runtime.system_prompt, &context_turns, self.config.context_max_messages as usize)
            .await;
        self.metrics.llm_latency_seconds.observe(llm_start.elapsed().as_secs_f64());

        match outcome {
            Ok(LlmOutcome::Reply(text)) => {
                vars.insert("resposta".to_string(), text);
                let (body, _) = self.templates.render_or_fallback(&runtime.template_name, &vars);
                body
            }
            Ok(LlmOutcome::InjectionBlocked) => {
                self.metrics.llm_prompt_injection_blocked_total.inc();
                PROMPT_INJECTION_REPLY.to_string()
            }
            Err(err) => {
                self.metrics.llm_errors_total.inc();
                tracing::warn!(error = %err, tenant_id = tenant.tenant_id, correlation_id = %job.correlation_id, "llm call failed, rendering technical_issue");
                let (body, _) = self.templates.render_or_fallback("technical_issue", &vars);
                body
            }
        }
    }

    /// Step 6 success path: one transaction upserting `conversations`,
    /// `delivery_logs`, and `customer_contexts`, then a profile-cache
    /// refresh so the next turn doesn't read the stale snapshot.
    async fn persist_success(
        &self,
        tenant: &tenancy::TenantContext,
        job: &QueueJob,
        final_message: &str,
        external_id: Option<&str>,
        updated_history: &[wa_core::context_engine::HistoryTurn],
        runtime: &RuntimeContext,
        sanitized_text: &str,
    ) -> anyhow::Result<()> {
        let context_json = serde_json::to_value(updated_history)?;
        let preferences = merge_preferences(runtime, sanitized_text);
        let frequent_topics = serde_json::to_value(&runtime.profile.frequent_topics)?;
        let product_mentions = serde_json::to_value(&runtime.profile.product_mentions)?;
        let last_subject = runtime.profile.last_subject.clone();

        persistence::persist_success(
            &self.db,
            tenant.tenant_id,
            &job.number,
            final_message,
            external_id,
            &context_json,
            &frequent_topics,
            &product_mentions,
            &preferences,
            last_subject.as_deref(),
        )
        .await?;

        let mut refreshed_profile = runtime.profile.clone();
        refreshed_profile.preferences = preferences;
        self.context_engine.cache_profile(tenant, &job.number, &refreshed_profile).await?;

        Ok(())
    }

    /// Routes the job to dead-letter and marks its flag on the in-flight
    /// copy (§4.9 step 7). The job is terminal after this call, so the flag
    /// only guards against this same `job` value being re-dead-lettered by
    /// a later branch in this function — defense-in-depth for property 8.
    async fn dead_letter(&self, job: &mut QueueJob, reason: &str) -> anyhow::Result<()> {
        self.queue
            .send_to_dead_letter(&self.config.dead_letter_queue_name, job, reason, self.config.dead_letter_result_ttl_seconds)
            .await?;
        job.sent_to_dead_letter = true;
        Ok(())
    }
}

/// Updates `preferences.ultimo_assunto/ultimo_sentimento/ultima_intencao`
/// under the existing preferences map, matching step 6's persisted fields.
fn merge_preferences(runtime: &RuntimeContext, sanitized_text: &str) -> serde_json::Value {
    let mut preferences = if runtime.profile.preferences.is_object() {
        runtime.profile.preferences.clone()
    } else {
        serde_json::json!({})
    };
    if let Some(map) = preferences.as_object_mut() {
        map.insert("ultimo_assunto".to_string(), serde_json::Value::String(sanitized_text.to_string()));
        map.insert("ultimo_sentimento".to_string(), serde_json::Value::String(runtime.sentiment.to_string()));
        map.insert("ultima_intencao".to_string(), serde_json::Value::String(runtime.intention.to_string()));
    }
    preferences
}

#[cfg(test)]
mod tests {
    use super::*;
    use wa_core::context_engine::{PersonalizationConfig, Profile};
    use wa_core::context_engine::sentiment::Sentiment;
    use wa_core::context_engine::intention::Intention;

    fn sample_runtime() -> RuntimeContext {
        RuntimeContext {
            history: vec![],
            system_prompt: "prompt".into(),
            template_vars: Default::default(),
            profile: Profile { preferences: serde_json::json!({"nome": "Maria"}), ..Profile::default() },
            personalization: PersonalizationConfig::default(),
            ai_enabled: true,
            sentiment: Sentiment::Positive,
            intention: Intention::FollowUp,
            template_name: "default".into(),
            tone_profile: "amigavel".into(),
            feedback: None,
        }
    }

    #[test]
    fn merge_preferences_keeps_existing_keys_and_adds_turn_fields() {
        let runtime = sample_runtime();
        let merged = merge_preferences(&runtime, "quero saber do pedido");
        assert_eq!(merged["nome"], "Maria");
        assert_eq!(merged["ultimo_assunto"], "quero saber do pedido");
        assert_eq!(merged["ultimo_sentimento"], "positive");
        assert_eq!(merged["ultima_intencao"], "follow_up");
    }

    #[test]
    fn merge_preferences_starts_fresh_when_preferences_not_an_object() {
        let mut runtime = sample_runtime();
        runtime.profile.preferences = serde_json::Value::Null;
        let merged = merge_preferences(&runtime, "oi");
        assert_eq!(merged["ultimo_assunto"], "oi");
    }
}
