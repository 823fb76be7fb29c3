use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Suspended,
    Cancelled,
}

/// A resolved tenant, carried through the rest of the pipeline instead of
/// re-resolving the domain on every downstream call.
#[derive(Debug, Clone)]
pub struct TenantContext {
    pub tenant_id: i64,
    pub label: String,
    pub status: TenantStatus,
}

impl TenantContext {
    /// Builds a tenant-scoped cache key, e.g. `company:42:ctx:profile:5511999999999`.
    pub fn namespaced_key(&self, parts: &[&str]) -> String {
        let mut key = format!("company:{}", self.tenant_id);
        for part in parts {
            key.push(':');
            key.push_str(part);
        }
        key
    }

    pub fn queue_name(&self, prefix: &str) -> String {
        format!("{prefix}:company_{}", self.tenant_id)
    }
}

/// Lowercases and strips a leading scheme/trailing path, matching
/// `_normalize_domain` in `app/services/tenancy.py`.
pub fn normalize_domain(raw: &str) -> String {
    let mut value = raw.trim().to_lowercase();
    for scheme in ["https://", "http://"] {
        if let Some(stripped) = value.strip_prefix(scheme) {
            value = stripped.to_string();
            break;
        }
    }
    if let Some(idx) = value.find('/') {
        value.truncate(idx);
    }
    if let Some(idx) = value.find(':') {
        value.truncate(idx);
    }
    value
}

/// Resolves the request domain from `X-Company-Domain`, falling back to `Host`.
pub fn extract_domain(company_domain_header: Option<&str>, host_header: Option<&str>) -> Option<String> {
    let raw = company_domain_header.or(host_header)?;
    let normalized = normalize_domain(raw);
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

#[derive(sqlx::FromRow)]
struct TenantRow {
    id: i64,
    name: String,
    status: String,
}

/// Looks up a tenant by normalized domain. Returns `CoreError::Tenancy` when
/// absent, matching `require_company` in `app/services/tenancy.py`.
pub async fn resolve_tenant(pool: &PgPool, domain: &str) -> Result<TenantContext, CoreError> {
    let row: Option<TenantRow> = sqlx::query_as(
        "SELECT id, name, status::text AS status FROM tenants WHERE lower(domain) = lower($1)",
    )
    .bind(domain)
    .fetch_optional(pool)
    .await?;

    let row = row.ok_or(CoreError::Tenancy)?;
    let status = match row.status.as_str() {
        "active" => TenantStatus::Active,
        "suspended" => TenantStatus::Suspended,
        _ => TenantStatus::Cancelled,
    };
    Ok(TenantContext { tenant_id: row.id, label: row.name, status })
}

/// Re-resolves a tenant from its id, used by `message-worker` when all it
/// has is the `tenant_id` carried on a dequeued job.
pub async fn resolve_tenant_by_id(pool: &PgPool, tenant_id: i64) -> Result<TenantContext, CoreError> {
    let row: Option<TenantRow> = sqlx::query_as("SELECT id, name, status::text AS status FROM tenants WHERE id = $1")
        .bind(tenant_id)
        .fetch_optional(pool)
        .await?;

    let row = row.ok_or(CoreError::Tenancy)?;
    let status = match row.status.as_str() {
        "active" => TenantStatus::Active,
        "suspended" => TenantStatus::Suspended,
        _ => TenantStatus::Cancelled,
    };
    Ok(TenantContext { tenant_id: row.id, label: row.name, status })
}

/// Ids of every non-cancelled tenant, polled by `message-worker` to know
/// which per-tenant queues to drain. Suspended tenants are still polled so
/// their dead-letter/retry bookkeeping keeps draining even while inbound
/// webhooks for them are rejected upstream.
pub async fn list_active_tenant_ids(pool: &PgPool) -> Result<Vec<i64>, CoreError> {
    let rows: Vec<(i64,)> = sqlx::query_as("SELECT id FROM tenants WHERE status::text <> 'cancelled'")
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_scheme_path_and_port() {
        assert_eq!(normalize_domain("HTTPS://Teste.Local/webhook"), "teste.local");
        assert_eq!(normalize_domain("teste.local:8443"), "teste.local");
        assert_eq!(normalize_domain(" teste.local "), "teste.local");
    }

    #[test]
    fn prefers_company_domain_header_over_host() {
        let resolved = extract_domain(Some("teste.local"), Some("other.local"));
        assert_eq!(resolved.as_deref(), Some("teste.local"));
    }

    #[test]
    fn falls_back_to_host_header() {
        let resolved = extract_domain(None, Some("fallback.local"));
        assert_eq!(resolved.as_deref(), Some("fallback.local"));
    }

    #[test]
    fn namespaced_key_matches_company_prefix_convention() {
        let tenant = TenantContext { tenant_id: 42, label: "Acme".into(), status: TenantStatus::Active };
        assert_eq!(tenant.namespaced_key(&["ctx", "profile", "5511999999999"]), "company:42:ctx:profile:5511999999999");
        assert_eq!(tenant.queue_name("default"), "default:company_42");
    }
}
