pub mod embedding;
pub mod intention;
pub mod retrain;
pub mod sentiment;

use std::collections::HashMap;

use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use sqlx::PgPool;

use crate::persistence;
use crate::tenancy::TenantContext;
use crate::template::TemplateSet;
use intention::{detect_intention, Intention};
use sentiment::{analyze_sentiment, detect_feedback, Sentiment};

/// One turn of conversation, normalized from either the cache or
/// `conversations.context_json`. Mirrors the `{role, body}` shape the
/// source's `_normalize_history_entry` produces from either representation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryTurn {
    pub role: String,
    pub body: String,
}

impl HistoryTurn {
    pub fn user(body: impl Into<String>) -> Self {
        Self { role: "user".into(), body: body.into() }
    }

    pub fn assistant(body: impl Into<String>) -> Self {
        Self { role: "assistant".into(), body: body.into() }
    }
}

/// `customer_contexts`, cached shape. Created with the §4.5 defaults when
/// absent from both cache and DB.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub frequent_topics: Vec<String>,
    pub product_mentions: Vec<String>,
    pub preferences: Json,
    pub embedding: Option<Json>,
    pub last_subject: Option<String>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            frequent_topics: Vec::new(),
            product_mentions: Vec::new(),
            preferences: json!({}),
            embedding: None,
            last_subject: None,
        }
    }
}

/// `personalization_configs`, cached shape. Defaults mirror
/// `_default_personalization` in `app/services/context.py`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonalizationConfig {
    pub tone_of_voice: String,
    pub message_limit: i64,
    pub opening_phrases: Vec<String>,
    pub ai_enabled: bool,
    pub formality_level: i32,
    pub empathy_level: i32,
    pub adaptive_humor: bool,
}

impl Default for PersonalizationConfig {
    fn default() -> Self {
        Self {
            tone_of_voice: "amigavel".into(),
            message_limit: 5,
            opening_phrases: Vec::new(),
            ai_enabled: true,
            formality_level: 50,
            empathy_level: 70,
            adaptive_humor: true,
        }
    }
}

/// Everything the LLM client and template renderer need for one turn,
/// matching the runtime context object described in §4.5.
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    pub history: Vec<HistoryTurn>,
    pub system_prompt: String,
    pub template_vars: HashMap<String, String>,
    pub profile: Profile,
    pub personalization: PersonalizationConfig,
    pub ai_enabled: bool,
    pub sentiment: Sentiment,
    pub intention: Intention,
    pub template_name: String,
    pub tone_profile: String,
    pub feedback: Option<&'static str>,
}

/// Builds runtime context by loading history/profile/personalization
/// through cache-then-DB fallbacks, then deriving sentiment, intention,
/// feedback, template selection, system prompt and template variables.
/// Grounded on `app/services/context.py::ContextEngine.build_context`.
pub struct ContextEngine {
    redis: redis::Client,
    db: PgPool,
    ttl_seconds: i64,
}

impl ContextEngine {
    pub fn new(redis_url: &str, db: PgPool, ttl_seconds: i64) -> anyhow::Result<Self> {
        Ok(Self { redis: redis::Client::open(redis_url)?, db, ttl_seconds })
    }

    async fn conn(&self) -> anyhow::Result<redis::aio::MultiplexedConnection> {
        Ok(self.redis.get_multiplexed_async_connection().await?)
    }

    /// Cache key `ctx:<number>`; miss falls back to the latest
    /// `conversations.context_json`, trimmed to `message_limit`.
    pub async fn load_history(
        &self,
        tenant: &TenantContext,
        number: &str,
        message_limit: i64,
    ) -> anyhow::Result<Vec<HistoryTurn>> {
        let key = tenant.namespaced_key(&["ctx", number]);
        let mut conn = self.conn().await?;
        let cached: Option<String> = conn.get(&key).await?;
        let history = if let Some(raw) = cached {
            serde_json::from_str::<Vec<HistoryTurn>>(&raw).unwrap_or_default()
        } else {
            let row = persistence::get_conversation(&self.db, tenant.tenant_id, number).await?;
            let loaded = row
                .map(|r| normalize_stored_history(&r.context_json))
                .unwrap_or_default();
            let payload = serde_json::to_string(&loaded)?;
            let _: () = conn.set_ex(&key, payload, self.ttl_seconds.max(1) as u64).await?;
            loaded
        };
        Ok(trim_history(history, message_limit))
    }

    /// Cache key `ctx:profile:<number>`; miss loads/creates `customer_contexts`.
    pub async fn load_profile(&self, tenant: &TenantContext, number: &str) -> anyhow::Result<Profile> {
        let key = tenant.namespaced_key(&["ctx", "profile", number]);
        let mut conn = self.conn().await?;
        if let Some(raw) = conn.get::<_, Option<String>>(&key).await? {
            if let Ok(profile) = serde_json::from_str::<Profile>(&raw) {
                return Ok(profile);
            }
        }
        let row = persistence::get_customer_context(&self.db, tenant.tenant_id, number).await?;
        let profile = match row {
            Some(r) => Profile {
                frequent_topics: json_to_string_vec(&r.frequent_topics),
                product_mentions: json_to_string_vec(&r.product_mentions),
                preferences: r.preferences,
                embedding: r.embedding,
                last_subject: r.last_subject,
            },
            None => {
                persistence::get_or_create_customer_context(&self.db, tenant.tenant_id, number).await?;
                Profile::default()
            }
        };
        let payload = serde_json::to_string(&profile)?;
        let _: () = conn.set_ex(&key, payload, self.ttl_seconds.max(1) as u64).await?;
        Ok(profile)
    }

    /// Cache key `ctx:personalization_config`; miss loads/creates the
    /// one-per-tenant row. Invalidated explicitly by admin collaborators
    /// via `invalidate_personalization`.
    pub async fn load_personalization(&self, tenant: &TenantContext) -> anyhow::Result<PersonalizationConfig> {
        let key = tenant.namespaced_key(&["ctx", "personalization_config"]);
        let mut conn = self.conn().await?;
        if let Some(raw) = conn.get::<_, Option<String>>(&key).await? {
            if let Ok(config) = serde_json::from_str::<PersonalizationConfig>(&raw) {
                return Ok(config);
            }
        }
        let row = persistence::get_personalization_config(&self.db, tenant.tenant_id).await?;
        let config = PersonalizationConfig {
            tone_of_voice: non_empty_or(row.tone_of_voice, "amigavel"),
            message_limit: row.message_limit.max(1) as i64,
            opening_phrases: json_to_string_vec(&row.opening_phrases),
            ai_enabled: row.ai_enabled,
            formality_level: row.formality_level.clamp(0, 100),
            empathy_level: row.empathy_level.clamp(0, 100),
            adaptive_humor: row.adaptive_humor,
        };
        let payload = serde_json::to_string(&config)?;
        let _: () = conn.set_ex(&key, payload, self.ttl_seconds.max(1) as u64).await?;
        Ok(config)
    }

    /// Overwrites the cached profile after the worker persists a fresh
    /// `customer_contexts` row, so the next turn's `load_profile` doesn't
    /// read back the pre-update snapshot.
    pub async fn cache_profile(&self, tenant: &TenantContext, number: &str, profile: &Profile) -> anyhow::Result<()> {
        let key = tenant.namespaced_key(&["ctx", "profile", number]);
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(profile)?;
        let _: () = conn.set_ex(&key, payload, self.ttl_seconds.max(1) as u64).await?;
        Ok(())
    }

    pub async fn invalidate_personalization(&self, tenant: &TenantContext) -> anyhow::Result<()> {
        let key = tenant.namespaced_key(&["ctx", "personalization_config"]);
        let mut conn = self.conn().await?;
        let _: () = conn.del(&key).await?;
        Ok(())
    }

    /// Tracks a rolling per-tenant sentiment tally, surfaced through
    /// `metrics:llm:error_rate`'s sibling hash keys for the analytics
    /// collaborator to read (out of scope here beyond the write).
    async fn bump_sentiment_counter(&self, tenant: &TenantContext, sentiment: Sentiment) -> anyhow::Result<()> {
        let key = tenant.namespaced_key(&["metrics", "sentiment"]);
        let mut conn = self.conn().await?;
        let _: () = conn.hincr(&key, sentiment.to_string(), 1i64).await?;
        Ok(())
    }

    async fn bump_feedback_counter(&self, tenant: &TenantContext, feedback: &str) -> anyhow::Result<()> {
        let key = tenant.namespaced_key(&["metrics", "satisfaction"]);
        let mut conn = self.conn().await?;
        let _: () = conn.hincr(&key, feedback, 1i64).await?;
        Ok(())
    }

    /// Full assembly per §4.5: load history/profile/personalization, derive
    /// sentiment/intention/feedback, select a template, build the system
    /// prompt and template variables.
    pub async fn build(
        &self,
        tenant: &TenantContext,
        number: &str,
        user_text: &str,
        templates: &TemplateSet,
    ) -> anyhow::Result<RuntimeContext> {
        let personalization = self.load_personalization(tenant).await?;
        let history = self.load_history(tenant, number, personalization.message_limit).await?;
        let profile = self.load_profile(tenant, number).await?;

        let (sentiment, _score) = analyze_sentiment(user_text);
        self.bump_sentiment_counter(tenant, sentiment).await?;

        let intention = detect_intention(user_text, &history);

        let feedback = detect_feedback(user_text);
        if let Some(label) = feedback {
            self.bump_feedback_counter(tenant, label).await?;
        }

        let template_name = select_template_name(intention, sentiment, templates);
        let system_prompt = build_system_prompt(&profile, &personalization, sentiment, intention, &history);
        let template_vars =
            build_template_vars(number, &profile, &personalization, sentiment, intention, &system_prompt);

        Ok(RuntimeContext {
            history,
            system_prompt,
            template_vars,
            ai_enabled: personalization.ai_enabled,
            tone_profile: personalization.tone_of_voice.clone(),
            personalization,
            profile,
            sentiment,
            intention,
            template_name,
            feedback,
        })
    }

    /// Appends the new turn pair and trims to `message_limit`, in memory
    /// only. Callers must not persist this to the history cache until the
    /// send that produced `assistant_msg` has actually succeeded — see
    /// `cache_history`.
    pub fn merge_history(
        prev_history: Vec<HistoryTurn>,
        user_msg: &str,
        assistant_msg: &str,
        personalization: &PersonalizationConfig,
    ) -> Vec<HistoryTurn> {
        let mut updated = prev_history;
        updated.push(HistoryTurn::user(user_msg));
        updated.push(HistoryTurn::assistant(assistant_msg));
        trim_history(updated, personalization.message_limit)
    }

    /// Writes an already-merged history to the `ctx:<number>` cache key.
    /// Matches `record_history`'s cache write in `app/services/
    /// context_engine.py`, called only after a successful delivery
    /// (§4.9 step 6: failures never mutate conversation state).
    pub async fn cache_history(&self, tenant: &TenantContext, number: &str, history: &[HistoryTurn]) -> anyhow::Result<()> {
        let key = tenant.namespaced_key(&["ctx", number]);
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(history)?;
        let _: () = conn.set_ex(&key, payload, self.ttl_seconds.max(1) as u64).await?;
        Ok(())
    }
}

fn non_empty_or(value: String, default: &str) -> String {
    if value.trim().is_empty() {
        default.to_string()
    } else {
        value
    }
}

fn trim_history(mut history: Vec<HistoryTurn>, message_limit: i64) -> Vec<HistoryTurn> {
    let limit = message_limit.max(0) as usize;
    if history.len() > limit {
        let drop = history.len() - limit;
        history.drain(0..drop);
    }
    history
}

/// Accepts either `[{role, body}]` (cache shape) or a looser `[{role,
/// content|text|message}]` shape some legacy rows may carry, matching the
/// source's tolerant `_normalize_history_entry`.
fn normalize_stored_history(raw: &Json) -> Vec<HistoryTurn> {
    let Some(entries) = raw.as_array() else { return Vec::new() };
    entries
        .iter()
        .filter_map(|entry| {
            let role = entry.get("role").and_then(Json::as_str)?.to_string();
            let body = entry
                .get("body")
                .or_else(|| entry.get("content"))
                .or_else(|| entry.get("text"))
                .and_then(Json::as_str)?
                .to_string();
            Some(HistoryTurn { role, body })
        })
        .collect()
}

fn json_to_string_vec(value: &Json) -> Vec<String> {
    value
        .as_array()
        .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

/// Candidate order `<intention>_<sentiment>` → `<intention>` →
/// `sentiment_<sentiment>` → `default`; first existing template wins.
fn select_template_name(intention: Intention, sentiment: Sentiment, templates: &TemplateSet) -> String {
    let candidates = [
        format!("{intention}_{sentiment}"),
        intention.to_string(),
        format!("sentiment_{sentiment}"),
        "default".to_string(),
    ];
    candidates.into_iter().find(|name| templates.exists(name)).unwrap_or_else(|| "default".to_string())
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}

/// Deterministic system prompt assembly, matching `_build_system_prompt`:
/// role/tone, customer name, formality/empathy, topic summary, product of
/// interest, last subject, recent dialogue, sentiment adaptation, humor
/// permission, detected intention — in that fixed order.
fn build_system_prompt(
    profile: &Profile,
    personalization: &PersonalizationConfig,
    sentiment: Sentiment,
    intention: Intention,
    history: &[HistoryTurn],
) -> String {
    let mut lines = Vec::new();
    lines.push("Você é um assistente de atendimento via WhatsApp.".to_string());
    lines.push(format!("Tom de voz: {}.", personalization.tone_of_voice));

    if let Some(name) = profile.preferences.get("nome").and_then(Json::as_str) {
        lines.push(format!("O cliente se chama {name}."));
    }

    lines.push(format!(
        "Grau de formalidade: {}/100. Grau de empatia: {}/100.",
        personalization.formality_level, personalization.empathy_level
    ));

    if !profile.frequent_topics.is_empty() {
        let top: Vec<&str> = profile.frequent_topics.iter().take(5).map(String::as_str).collect();
        lines.push(format!("Temas frequentes do cliente: {}.", top.join(", ")));
    }

    if let Some(product) = profile.product_mentions.first() {
        lines.push(format!("Produto de interesse: {product}."));
    }

    if let Some(subject) = &profile.last_subject {
        lines.push(format!("Último assunto tratado: {subject}."));
    }

    if !history.is_empty() {
        let recent = history
            .iter()
            .rev()
            .take(4)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .map(|turn| {
                let speaker = if turn.role == "assistant" { "Assistente" } else { "Cliente" };
                format!("{speaker}: {}", truncate_chars(&turn.body, 100))
            })
            .collect::<Vec<_>>();
        lines.push(format!("Diálogo recente: {}.", recent.join(" | ")));
    }

    match sentiment {
        Sentiment::Negative => {
            lines.push("O cliente parece insatisfeito: responda com mais empatia e cuidado.".to_string())
        }
        Sentiment::Positive => {
            lines.push("O cliente parece satisfeito: pode responder com mais entusiasmo.".to_string())
        }
        Sentiment::Neutral => {}
    }

    if personalization.adaptive_humor && sentiment != Sentiment::Negative {
        lines.push("Humor leve é permitido quando apropriado.".to_string());
    }

    lines.push(format!("Intenção detectada: {intention}."));
    lines.join(" ")
}

/// Populates the template-variable set named in §4.5; `resposta` is filled
/// in by the worker once the LLM output (or fallback text) is known.
fn build_template_vars(
    number: &str,
    profile: &Profile,
    personalization: &PersonalizationConfig,
    sentiment: Sentiment,
    intention: Intention,
    system_prompt: &str,
) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    let nome = profile.preferences.get("nome").and_then(Json::as_str).unwrap_or("").to_string();
    let produto = profile.product_mentions.first().cloned().unwrap_or_default();
    let ultimo_assunto = profile.last_subject.clone().unwrap_or_default();
    let saudacao = personalization.opening_phrases.first().cloned().unwrap_or_else(|| "Olá".to_string());
    let empatia_texto = if sentiment == Sentiment::Negative { "Sinto muito pelo inconveniente. " } else { "" };
    let humor_extra = if personalization.adaptive_humor && sentiment != Sentiment::Negative { " 😉" } else { "" };

    vars.insert("nome".into(), nome);
    vars.insert("produto".into(), produto);
    vars.insert("ultimo_assunto".into(), ultimo_assunto);
    vars.insert("saudacao".into(), saudacao);
    vars.insert("resposta".into(), String::new());
    vars.insert("transferencia".into(), String::new());
    vars.insert("tom".into(), personalization.tone_of_voice.clone());
    vars.insert("contexto_recente".into(), system_prompt.to_string());
    vars.insert("empatia_texto".into(), empatia_texto.to_string());
    vars.insert("humor_extra".into(), humor_extra.to_string());
    vars.insert("sentimento".into(), sentiment.to_string());
    vars.insert("intencao".into(), intention.to_string());
    vars.insert("grau_formalidade".into(), personalization.formality_level.to_string());
    vars.insert("grau_empatia".into(), personalization.empathy_level.to_string());
    vars.insert("humor_ativo".into(), personalization.adaptive_humor.to_string());
    vars.insert("numero".into(), number.to_string());
    vars
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::TemplateSet;

    fn templates() -> TemplateSet {
        TemplateSet::load_str(
            r#"
default:
  template: "{{resposta}}"
fallback:
  template: "{{transferencia}}"
greeting:
  template: "{{saudacao}}"
sentiment_negative:
  template: "{{empatia_texto}}{{resposta}}"
"#,
        )
        .unwrap()
    }

    #[test]
    fn selects_intention_match_over_sentiment_match() {
        let name = select_template_name(Intention::Greeting, Sentiment::Negative, &templates());
        assert_eq!(name, "greeting");
    }

    #[test]
    fn falls_back_to_sentiment_then_default() {
        let name = select_template_name(Intention::FollowUp, Sentiment::Negative, &templates());
        assert_eq!(name, "sentiment_negative");
        let name = select_template_name(Intention::FollowUp, Sentiment::Neutral, &templates());
        assert_eq!(name, "default");
    }

    #[test]
    fn trims_history_to_message_limit() {
        let history = vec![
            HistoryTurn::user("a"),
            HistoryTurn::assistant("b"),
            HistoryTurn::user("c"),
            HistoryTurn::assistant("d"),
        ];
        let trimmed = trim_history(history, 2);
        assert_eq!(trimmed.len(), 2);
        assert_eq!(trimmed[0].body, "c");
    }

    #[test]
    fn system_prompt_includes_topic_and_intention() {
        let mut profile = Profile::default();
        profile.frequent_topics = vec!["entrega".into(), "garantia".into()];
        profile.last_subject = Some("pedido 123".into());
        let personalization = PersonalizationConfig::default();
        let prompt = build_system_prompt(&profile, &personalization, Sentiment::Neutral, Intention::Doubt, &[]);
        assert!(prompt.contains("entrega, garantia"));
        assert!(prompt.contains("pedido 123"));
        assert!(prompt.contains("Intenção detectada: doubt"));
    }

    #[test]
    fn template_vars_carry_all_named_keys() {
        let profile = Profile::default();
        let personalization = PersonalizationConfig::default();
        let vars = build_template_vars("5511999999999", &profile, &personalization, Sentiment::Positive, Intention::FollowUp, "prompt");
        for key in [
            "nome", "produto", "ultimo_assunto", "saudacao", "resposta", "transferencia", "tom",
            "contexto_recente", "empatia_texto", "humor_extra", "sentimento", "intencao",
            "grau_formalidade", "grau_empatia", "humor_ativo", "numero",
        ] {
            assert!(vars.contains_key(key), "missing var {key}");
        }
        assert_eq!(vars["numero"], "5511999999999");
    }

    #[test]
    fn humor_extra_suppressed_on_negative_sentiment() {
        let profile = Profile::default();
        let personalization = PersonalizationConfig::default();
        let vars = build_template_vars("n", &profile, &personalization, Sentiment::Negative, Intention::FollowUp, "p");
        assert!(vars["humor_extra"].is_empty());
        assert!(!vars["empatia_texto"].is_empty());
    }
}
