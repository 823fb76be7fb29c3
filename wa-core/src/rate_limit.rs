use async_trait::async_trait;
use redis::AsyncCommands;
use std::time::{SystemTime, UNIX_EPOCH};

/// Sliding-window rate limiter contract. Kept as a trait so tests can swap
/// in an in-memory implementation, following the teacher's
/// `rate_limiter.rs::RateLimiterEngine` shape — but the Redis body below
/// implements the sorted-set sliding window from
/// `app/services/rate_limit.py::_check_limit`, not the teacher's fixed
/// `INCR`/`EXPIRE` window.
#[async_trait]
pub trait RateLimiterEngine: Send + Sync {
    async fn check(&self, key: &str, limit: i64, window_seconds: i64, ttl_seconds: i64) -> anyhow::Result<bool>;
}

pub struct RedisRateLimiter {
    client: redis::Client,
}

impl RedisRateLimiter {
    pub fn new(redis_url: &str) -> anyhow::Result<Self> {
        Ok(Self { client: redis::Client::open(redis_url)? })
    }
}

#[async_trait]
impl RateLimiterEngine for RedisRateLimiter {
    async fn check(&self, key: &str, limit: i64, window_seconds: i64, ttl_seconds: i64) -> anyhow::Result<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs_f64();
        let window_start = now - window_seconds as f64;

        let (_, _, count, _): (i64, i64, i64, bool) = redis::pipe()
            .atomic()
            .zrembyscore(key, 0, window_start)
            .zadd(key, now.to_string(), now)
            .zcard(key)
            .expire(key, ttl_seconds as usize)
            .query_async(&mut conn)
            .await?;

        Ok(count <= limit)
    }
}

/// In-memory stand-in for tests, independent of wall-clock Redis state.
pub struct InMemoryRateLimiter {
    hits: tokio::sync::Mutex<std::collections::HashMap<String, Vec<f64>>>,
}

impl InMemoryRateLimiter {
    pub fn new() -> Self {
        Self { hits: tokio::sync::Mutex::new(std::collections::HashMap::new()) }
    }
}

impl Default for InMemoryRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimiterEngine for InMemoryRateLimiter {
    async fn check(&self, key: &str, limit: i64, window_seconds: i64, _ttl_seconds: i64) -> anyhow::Result<bool> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs_f64();
        let window_start = now - window_seconds as f64;
        let mut hits = self.hits.lock().await;
        let entry = hits.entry(key.to_string()).or_default();
        entry.retain(|ts| *ts > window_start);
        entry.push(now);
        Ok(entry.len() as i64 <= limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_limiter_allows_up_to_limit_then_rejects() {
        let limiter = InMemoryRateLimiter::new();
        for _ in 0..3 {
            assert!(limiter.check("k", 3, 60, 60).await.unwrap());
        }
        assert!(!limiter.check("k", 3, 60, 60).await.unwrap());
    }

    #[tokio::test]
    async fn in_memory_limiter_keys_are_independent() {
        let limiter = InMemoryRateLimiter::new();
        assert!(limiter.check("a", 1, 60, 60).await.unwrap());
        assert!(limiter.check("b", 1, 60, 60).await.unwrap());
        assert!(!limiter.check("a", 1, 60, 60).await.unwrap());
    }
}
