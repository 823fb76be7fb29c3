use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Per-tenant circuit state, JSON-encoded under `llm:circuit`. Mirrors
/// `app/services/llm.py::CircuitBreaker` — no half-open state, a single
/// success clears the key outright.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BreakerState {
    failures: u32,
    open: bool,
    opened_at: Option<i64>,
}

pub struct CircuitBreaker {
    client: redis::Client,
    key: String,
    threshold: u32,
    reset_seconds: i64,
}

impl CircuitBreaker {
    pub fn new(redis_url: &str, key: String, threshold: u32, reset_seconds: i64) -> anyhow::Result<Self> {
        Ok(Self { client: redis::Client::open(redis_url)?, key, threshold, reset_seconds })
    }

    fn now() -> i64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
    }

    async fn load(&self, conn: &mut redis::aio::MultiplexedConnection) -> anyhow::Result<BreakerState> {
        let raw: Option<String> = conn.get(&self.key).await?;
        match raw {
            Some(raw) => Ok(serde_json::from_str(&raw).unwrap_or(BreakerState { failures: 0, open: false, opened_at: None })),
            None => Ok(BreakerState { failures: 0, open: false, opened_at: None }),
        }
    }

    async fn store(&self, conn: &mut redis::aio::MultiplexedConnection, state: &BreakerState) -> anyhow::Result<()> {
        let payload = serde_json::to_string(state)?;
        let _: () = conn.set(&self.key, payload).await?;
        Ok(())
    }

    /// True unless the breaker is open and the reset window has not yet
    /// elapsed. There is no half-open probe budget: once `reset_seconds`
    /// passes, the very next call proceeds without restriction.
    pub async fn allow(&self) -> anyhow::Result<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let state = self.load(&mut conn).await?;
        if !state.open {
            return Ok(true);
        }
        let opened_at = state.opened_at.unwrap_or(0);
        Ok(Self::now() - opened_at >= self.reset_seconds)
    }

    pub async fn record_success(&self) -> anyhow::Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.del(&self.key).await?;
        Ok(())
    }

    pub async fn record_failure(&self) -> anyhow::Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let mut state = self.load(&mut conn).await?;
        state.failures += 1;
        if state.failures >= self.threshold {
            state.open = true;
            state.opened_at = Some(Self::now());
        }
        self.store(&mut conn, &state).await
    }
}
