use std::sync::Arc;

use redis::AsyncCommands;
use sqlx::PgPool;
use wa_core::config::Config;
use wa_core::metrics::WaMetrics;
use wa_core::queue::QueueGateway;
use wa_core::rate_limit::{RateLimiterEngine, RedisRateLimiter};

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: Arc<Config>,
    pub metrics: Arc<WaMetrics>,
    pub rate_limiter: Arc<dyn RateLimiterEngine>,
    pub queue: Arc<QueueGateway>,
    pub redis: redis::Client,
}

impl AppState {
    pub fn new(db: PgPool, config: Arc<Config>) -> anyhow::Result<Self> {
        let metrics = Arc::new(WaMetrics::new()?);
        let rate_limiter: Arc<dyn RateLimiterEngine> = Arc::new(RedisRateLimiter::new(&config.redis_url)?);
        let queue = Arc::new(QueueGateway::new(&config.redis_url)?);
        let redis = redis::Client::open(config.redis_url.clone())?;
        Ok(Self { db, config, metrics, rate_limiter, queue, redis })
    }

    pub async fn ping_cache(&self) -> anyhow::Result<()> {
        let mut conn = self.redis.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn ping_db(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(&self.db).await?;
        Ok(())
    }

    /// Last worker heartbeat age in seconds, or `None` if no worker has
    /// ever reported in (key absent). `message-worker` refreshes this key
    /// on every poll loop iteration.
    pub async fn worker_heartbeat_age_seconds(&self) -> anyhow::Result<Option<i64>> {
        let mut conn = self.redis.get_multiplexed_async_connection().await?;
        let raw: Option<i64> = conn.get("workers:heartbeat").await?;
        Ok(raw.map(|ts| now_seconds() - ts))
    }
}

pub fn now_seconds() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
}
