use chrono::{DateTime, Utc};
use serde_json::Value as Json;
use sqlx::PgPool;

/// Row shapes mirror the `conversations`/`delivery_logs`/`customer_contexts`/
/// `personalization_configs` tables added in migrations 0001, 0003-0005.
/// All queries are runtime-checked `query_as`/`query`, never the
/// compile-time `query_as!`/`query!` macros, since no live `DATABASE_URL`
/// is available while this crate is authored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ConversationRow {
    pub id: i64,
    pub company_id: i64,
    pub number: String,
    pub user_name: Option<String>,
    pub last_message: Option<String>,
    pub context_json: Json,
    pub updated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CustomerContextRow {
    pub id: i64,
    pub company_id: i64,
    pub number: String,
    pub frequent_topics: Json,
    pub product_mentions: Json,
    pub preferences: Json,
    pub embedding: Option<Json>,
    pub last_subject: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PersonalizationConfigRow {
    pub id: i64,
    pub company_id: i64,
    pub tone_of_voice: String,
    pub message_limit: i32,
    pub opening_phrases: Json,
    pub ai_enabled: bool,
    pub formality_level: i32,
    pub empathy_level: i32,
    pub adaptive_humor: bool,
    pub updated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

pub async fn get_conversation(pool: &PgPool, company_id: i64, number: &str) -> Result<Option<ConversationRow>, sqlx::Error> {
    sqlx::query_as::<_, ConversationRow>(
        "SELECT id, company_id, number, user_name, last_message, context_json, updated_at, created_at \
         FROM conversations WHERE company_id = $1 AND number = $2",
    )
    .bind(company_id)
    .bind(number)
    .fetch_optional(pool)
    .await
}

pub async fn get_or_create_conversation(pool: &PgPool, company_id: i64, number: &str) -> Result<ConversationRow, sqlx::Error> {
    if let Some(row) = get_conversation(pool, company_id, number).await? {
        return Ok(row);
    }
    sqlx::query_as::<_, ConversationRow>(
        "INSERT INTO conversations (company_id, number, context_json, created_at) \
         VALUES ($1, $2, '[]'::jsonb, now()) \
         ON CONFLICT (company_id, number) DO UPDATE SET number = EXCLUDED.number \
         RETURNING id, company_id, number, user_name, last_message, context_json, updated_at, created_at",
    )
    .bind(company_id)
    .bind(number)
    .fetch_one(pool)
    .await
}

pub async fn update_conversation_context(
    pool: &PgPool,
    company_id: i64,
    number: &str,
    last_message: &str,
    context_json: &Json,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE conversations SET last_message = $3, context_json = $4, updated_at = now() \
         WHERE company_id = $1 AND number = $2",
    )
    .bind(company_id)
    .bind(number)
    .bind(last_message)
    .bind(context_json)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn add_delivery_log(
    pool: &PgPool,
    company_id: i64,
    number: &str,
    body: &str,
    status: &str,
    external_id: Option<&str>,
    error: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO delivery_logs (company_id, number, body, status, external_id, error, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, now())",
    )
    .bind(company_id)
    .bind(number)
    .bind(body)
    .bind(status)
    .bind(external_id)
    .bind(error)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_customer_context(pool: &PgPool, company_id: i64, number: &str) -> Result<Option<CustomerContextRow>, sqlx::Error> {
    sqlx::query_as::<_, CustomerContextRow>(
        "SELECT id, company_id, number, frequent_topics, product_mentions, preferences, embedding, last_subject, updated_at, created_at \
         FROM customer_contexts WHERE company_id = $1 AND number = $2",
    )
    .bind(company_id)
    .bind(number)
    .fetch_optional(pool)
    .await
}

pub async fn get_or_create_customer_context(pool: &PgPool, company_id: i64, number: &str) -> Result<CustomerContextRow, sqlx::Error> {
    if let Some(row) = get_customer_context(pool, company_id, number).await? {
        return Ok(row);
    }
    sqlx::query_as::<_, CustomerContextRow>(
        "INSERT INTO customer_contexts (company_id, number, frequent_topics, product_mentions, preferences, created_at) \
         VALUES ($1, $2, '[]'::jsonb, '[]'::jsonb, '{}'::jsonb, now()) \
         ON CONFLICT (company_id, number) DO UPDATE SET number = EXCLUDED.number \
         RETURNING id, company_id, number, frequent_topics, product_mentions, preferences, embedding, last_subject, updated_at, created_at",
    )
    .bind(company_id)
    .bind(number)
    .fetch_one(pool)
    .await
}

pub async fn save_customer_context(
    pool: &PgPool,
    company_id: i64,
    number: &str,
    frequent_topics: &Json,
    product_mentions: &Json,
    preferences: &Json,
    last_subject: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE customer_contexts SET frequent_topics = $3, product_mentions = $4, preferences = $5, \
         last_subject = $6, updated_at = now() WHERE company_id = $1 AND number = $2",
    )
    .bind(company_id)
    .bind(number)
    .bind(frequent_topics)
    .bind(product_mentions)
    .bind(preferences)
    .bind(last_subject)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_personalization_config(pool: &PgPool, company_id: i64) -> Result<PersonalizationConfigRow, sqlx::Error> {
    if let Some(row) = sqlx::query_as::<_, PersonalizationConfigRow>(
        "SELECT id, company_id, tone_of_voice, message_limit, opening_phrases, ai_enabled, \
         formality_level, empathy_level, adaptive_humor, updated_at, created_at \
         FROM personalization_configs WHERE company_id = $1",
    )
    .bind(company_id)
    .fetch_optional(pool)
    .await?
    {
        return Ok(row);
    }

    sqlx::query_as::<_, PersonalizationConfigRow>(
        "INSERT INTO personalization_configs (company_id, created_at) VALUES ($1, now()) \
         ON CONFLICT (company_id) DO UPDATE SET company_id = EXCLUDED.company_id \
         RETURNING id, company_id, tone_of_voice, message_limit, opening_phrases, ai_enabled, \
         formality_level, empathy_level, adaptive_humor, updated_at, created_at",
    )
    .bind(company_id)
    .fetch_one(pool)
    .await
}

/// Step 6 success path of `app/services/tasks.py::process_message`: a
/// single transaction that upserts `conversations`, writes the `SENT`
/// `delivery_logs` row, and upserts `customer_contexts`. Rolls back as a
/// unit on any failure (property 6, §8).
#[allow(clippy::too_many_arguments)]
pub async fn persist_success(
    pool: &PgPool,
    company_id: i64,
    number: &str,
    body: &str,
    external_id: Option<&str>,
    context_json: &Json,
    frequent_topics: &Json,
    product_mentions: &Json,
    preferences: &Json,
    last_subject: Option<&str>,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        "INSERT INTO conversations (company_id, number, last_message, context_json, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, now(), now()) \
         ON CONFLICT (company_id, number) DO UPDATE SET \
         last_message = EXCLUDED.last_message, context_json = EXCLUDED.context_json, updated_at = now()",
    )
    .bind(company_id)
    .bind(number)
    .bind(body)
    .bind(context_json)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "INSERT INTO delivery_logs (company_id, number, body, status, external_id, error, created_at) \
         VALUES ($1, $2, $3, 'SENT', $4, NULL, now())",
    )
    .bind(company_id)
    .bind(number)
    .bind(body)
    .bind(external_id)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "INSERT INTO customer_contexts (company_id, number, frequent_topics, product_mentions, preferences, last_subject, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, now(), now()) \
         ON CONFLICT (company_id, number) DO UPDATE SET \
         frequent_topics = EXCLUDED.frequent_topics, product_mentions = EXCLUDED.product_mentions, \
         preferences = EXCLUDED.preferences, last_subject = EXCLUDED.last_subject, updated_at = now()",
    )
    .bind(company_id)
    .bind(number)
    .bind(frequent_topics)
    .bind(product_mentions)
    .bind(preferences)
    .bind(last_subject)
    .execute(&mut *tx)
    .await?;

    tx.commit().await
}

/// Failure path: writes only the `delivery_logs` row, never touching
/// `conversations`/`customer_contexts` (§4.9 step 6).
pub async fn persist_failure(
    pool: &PgPool,
    company_id: i64,
    number: &str,
    body: &str,
    status: &str,
    external_id: Option<&str>,
    error: Option<&str>,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO delivery_logs (company_id, number, body, status, external_id, error, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, now())",
    )
    .bind(company_id)
    .bind(number)
    .bind(body)
    .bind(status)
    .bind(external_id)
    .bind(error)
    .execute(&mut *tx)
    .await?;
    tx.commit().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_types_carry_tenant_scoping_column() {
        fn assert_has_company_id<T>(_: fn(&T) -> i64) {}
        assert_has_company_id::<ConversationRow>(|r| r.company_id);
        assert_has_company_id::<CustomerContextRow>(|r| r.company_id);
        assert_has_company_id::<PersonalizationConfigRow>(|r| r.company_id);
    }
}
