mod worker;

use std::sync::Arc;
use std::time::Duration;

use redis::AsyncCommands;
use sqlx::postgres::PgPoolOptions;

use wa_core::config::Config;
use wa_core::context_engine::ContextEngine;
use wa_core::gateway_client::GatewayClient;
use wa_core::llm::LlmClient;
use wa_core::metrics::WaMetrics;
use wa_core::queue::QueueGateway;
use wa_core::template::TemplateSet;
use wa_core::tenancy;

use worker::Worker;

const RESPONSE_TEMPLATES_YAML: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/../wa-core/templates/response_templates.yaml"));

fn now_seconds() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let config = Arc::new(Config::from_env());

    let db_pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(config.request_timeout_seconds))
        .connect(&config.database_url)
        .await?;

    let metrics = Arc::new(WaMetrics::new()?);
    let queue = Arc::new(QueueGateway::new(&config.redis_url)?);
    let templates = Arc::new(TemplateSet::load_str(RESPONSE_TEMPLATES_YAML)?);
    let context_engine = Arc::new(ContextEngine::new(&config.redis_url, db_pool.clone(), config.context_ttl_seconds)?);
    let llm = Arc::new(LlmClient::new(config.gemini_api_key.clone(), config.llm_retry_attempts, config.llm_timeout_seconds)?);

    let gateway = Arc::new(if config.enable_jwt_login {
        GatewayClient::with_jwt_login(
            config.whatsapp_api_url.clone(),
            config.whaticket_jwt_email.clone().unwrap_or_default(),
            config.whaticket_jwt_password.clone().unwrap_or_default(),
            &config.redis_url,
            config.whaticket_retry_attempts,
        )?
    } else {
        GatewayClient::with_bearer_token(
            config.whatsapp_api_url.clone(),
            config.whatsapp_bearer_token.clone(),
            &config.redis_url,
            config.whaticket_retry_attempts,
        )?
    });

    let worker = Arc::new(Worker {
        db: db_pool.clone(),
        config: config.clone(),
        metrics: metrics.clone(),
        context_engine,
        llm,
        gateway,
        queue: queue.clone(),
        templates,
        redis_url: config.redis_url.clone(),
    });

    tracing::info!(concurrency = config.worker_concurrency, "starting message-worker");

    let mut tasks = Vec::new();
    for slot in 0..config.worker_concurrency.max(1) {
        tasks.push(tokio::spawn(run_worker_slot(slot, worker.clone(), db_pool.clone(), config.clone())));
    }
    tasks.push(tokio::spawn(run_retry_promoter(db_pool.clone(), queue.clone(), config.clone())));
    tasks.push(tokio::spawn(run_heartbeat(config.clone())));
    tasks.push(tokio::spawn(run_queue_depth_reporter(db_pool.clone(), queue.clone(), metrics.clone(), config.clone())));

    for task in tasks {
        task.await?;
    }
    Ok(())
}

/// One of `WORKER_CONCURRENCY` independent loops: lists active tenants,
/// pops at most one ready job per tenant per round with a short `BLPOP`
/// timeout, and processes whatever it finds, idling briefly when nothing
/// is ready across any tenant.
async fn run_worker_slot(slot: usize, worker: Arc<Worker>, db: sqlx::PgPool, config: Arc<Config>) {
    loop {
        let tenant_ids = match tenancy::list_active_tenant_ids(&db).await {
            Ok(ids) => ids,
            Err(err) => {
                tracing::warn!(slot, error = %err, "failed to list tenants for worker slot");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        if tenant_ids.is_empty() {
            tokio::time::sleep(Duration::from_secs(1)).await;
            continue;
        }

        let mut processed_any = false;
        for tenant_id in tenant_ids {
            match worker.queue.dequeue(&config.queue_name, tenant_id, 0.2).await {
                Ok(Some(job)) => {
                    processed_any = true;
                    let correlation_id = job.correlation_id.clone();
                    let number = job.number.clone();
                    match worker.process(job).await {
                        Ok(worker::JobOutcome::Sent) => tracing::info!(tenant_id, correlation_id, number, "job sent"),
                        Ok(worker::JobOutcome::RetryScheduled) => {
                            tracing::info!(tenant_id, correlation_id, number, "job scheduled for retry")
                        }
                        Ok(worker::JobOutcome::DeadLettered) => {
                            tracing::warn!(tenant_id, correlation_id, number, "job dead-lettered")
                        }
                        Err(err) => tracing::error!(error = %err, tenant_id, correlation_id, number, "job processing failed"),
                    }
                }
                Ok(None) => {}
                Err(err) => tracing::warn!(tenant_id, error = %err, "dequeue failed"),
            }
        }
        if !processed_any {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}

/// Moves due delayed retries onto the ready list for every active tenant,
/// the mover task described in §4.4.
async fn run_retry_promoter(db: sqlx::PgPool, queue: Arc<QueueGateway>, config: Arc<Config>) {
    loop {
        if let Ok(tenant_ids) = tenancy::list_active_tenant_ids(&db).await {
            for tenant_id in tenant_ids {
                if let Err(err) = queue.promote_due_retries(&config.queue_name, tenant_id).await {
                    tracing::warn!(tenant_id, error = %err, "failed to promote due retries");
                }
            }
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

/// Refreshes `workers:heartbeat` so `webhook-gateway`'s `/healthz` can
/// treat the worker pool as live (< 180s old, §6).
async fn run_heartbeat(config: Arc<Config>) {
    let Ok(client) = redis::Client::open(config.redis_url.clone()) else {
        tracing::error!("heartbeat task could not open redis client");
        return;
    };
    loop {
        if let Ok(mut conn) = client.get_multiplexed_async_connection().await {
            let _: Result<(), _> = conn.set("workers:heartbeat", now_seconds()).await;
        }
        tokio::time::sleep(Duration::from_secs(30)).await;
    }
}

/// Periodically samples per-tenant queue depth into the `queue_size` and
/// `dead_letter_queue_size` gauges required by §6.
async fn run_queue_depth_reporter(db: sqlx::PgPool, queue: Arc<QueueGateway>, metrics: Arc<WaMetrics>, config: Arc<Config>) {
    loop {
        if let Ok(tenant_ids) = tenancy::list_active_tenant_ids(&db).await {
            for tenant_id in tenant_ids {
                let label = match tenancy::resolve_tenant_by_id(&db, tenant_id).await {
                    Ok(tenant) => tenant.label,
                    Err(_) => tenant_id.to_string(),
                };
                if let Ok(len) = queue.queue_length(&config.queue_name, tenant_id).await {
                    metrics.queue_size.with_label_values(&[&label]).set(len);
                }
                if let Ok(len) = queue.dead_letter_length(&config.dead_letter_queue_name, tenant_id).await {
                    metrics.dead_letter_queue_size.with_label_values(&[&label]).set(len);
                }
            }
        }
        tokio::time::sleep(Duration::from_secs(15)).await;
    }
}
