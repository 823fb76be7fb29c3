use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::payload::MessageKind;

/// A unit of work for `message-worker`. Mirrors the RQ job meta fields used
/// throughout `app/services/tasks.py` (`number`, `body`, `kind`,
/// `correlation_id`, plus the retry/dead-letter bookkeeping that lived in
/// job metadata in the original).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueJob {
    pub tenant_id: i64,
    pub number: String,
    pub text: String,
    pub kind: MessageKind,
    pub correlation_id: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub sent_to_dead_letter: bool,
    #[serde(default)]
    pub reprocessed_from_dead_letter: bool,
}

impl QueueJob {
    pub fn new(tenant_id: i64, number: String, text: String, kind: MessageKind, correlation_id: String, max_attempts: u32) -> Self {
        Self {
            tenant_id,
            number,
            text,
            kind,
            correlation_id,
            attempt: 0,
            max_attempts,
            sent_to_dead_letter: false,
            reprocessed_from_dead_letter: false,
        }
    }

    pub fn retries_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterJob {
    pub job: QueueJob,
    pub reason: String,
}

/// Enqueue/dead-letter/retry primitive built on Redis lists and a
/// sorted-set delay schedule, replacing the teacher's Kafka pub/sub
/// (`rdkafka`) with the RQ-equivalent shape `app/services/tasks.py`
/// actually needs: retryable jobs with a fixed delay schedule and a
/// separate dead-letter queue.
pub struct QueueGateway {
    client: redis::Client,
}

impl QueueGateway {
    pub fn new(redis_url: &str) -> anyhow::Result<Self> {
        Ok(Self { client: redis::Client::open(redis_url)? })
    }

    fn ready_key(&self, queue_name: &str, tenant_id: i64) -> String {
        format!("{queue_name}:company_{tenant_id}")
    }

    fn delayed_key(&self, queue_name: &str, tenant_id: i64) -> String {
        format!("{queue_name}:company_{tenant_id}:delayed")
    }

    /// Pushes a job onto the ready list for immediate pickup.
    pub async fn enqueue(&self, queue_name: &str, job: &QueueJob) -> anyhow::Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(job)?;
        let _: () = conn.rpush(self.ready_key(queue_name, job.tenant_id), payload).await?;
        Ok(())
    }

    /// Schedules a retry to become ready after `delay_seconds`, used when a
    /// transient gateway or LLM failure triggers the job's retry policy.
    pub async fn schedule_retry(&self, queue_name: &str, job: &QueueJob, delay_seconds: u64) -> anyhow::Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let due = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() + delay_seconds;
        let payload = serde_json::to_string(job)?;
        let _: () = conn.zadd(self.delayed_key(queue_name, job.tenant_id), payload, due).await?;
        Ok(())
    }

    /// Moves any delayed jobs whose due-time has passed onto the ready list.
    /// Run periodically by a background task in `message-worker`, the same
    /// polling idiom the teacher uses for its key-cache refresh loop.
    pub async fn promote_due_retries(&self, queue_name: &str, tenant_id: i64) -> anyhow::Result<u64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        let delayed_key = self.delayed_key(queue_name, tenant_id);
        let ready_key = self.ready_key(queue_name, tenant_id);
        let due: Vec<String> = conn.zrangebyscore(&delayed_key, 0, now as f64).await?;
        let mut promoted = 0u64;
        for payload in &due {
            let _: () = conn.rpush(&ready_key, payload).await?;
            let _: () = conn.zrem(&delayed_key, payload).await?;
            promoted += 1;
        }
        Ok(promoted)
    }

    /// Ready-list depth for a tenant, polled into the `queue_size` gauge.
    pub async fn queue_length(&self, queue_name: &str, tenant_id: i64) -> anyhow::Result<i64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn.llen(self.ready_key(queue_name, tenant_id)).await?)
    }

    /// Dead-letter depth for a tenant, polled into the `dead_letter_queue_size` gauge.
    pub async fn dead_letter_length(&self, dead_letter_queue_name: &str, tenant_id: i64) -> anyhow::Result<i64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = format!("{dead_letter_queue_name}:company_{tenant_id}");
        Ok(conn.llen(&key).await?)
    }

    /// Blocking pop off the ready list, used by worker loops.
    pub async fn dequeue(&self, queue_name: &str, tenant_id: i64, timeout_seconds: f64) -> anyhow::Result<Option<QueueJob>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let result: Option<(String, String)> = conn.blpop(self.ready_key(queue_name, tenant_id), timeout_seconds).await?;
        match result {
            Some((_, payload)) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    /// Routes a permanently-failed job to the dead-letter queue, guarded by
    /// the job's own `sent_to_dead_letter` flag so retried callers never
    /// double-enqueue the same job (property 8, §8).
    pub async fn send_to_dead_letter(
        &self,
        dead_letter_queue_name: &str,
        job: &QueueJob,
        reason: &str,
        result_ttl_seconds: i64,
    ) -> anyhow::Result<bool> {
        if job.sent_to_dead_letter {
            return Ok(false);
        }
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = format!("{dead_letter_queue_name}:company_{}", job.tenant_id);
        let entry = DeadLetterJob { job: job.clone(), reason: reason.to_string() };
        let payload = serde_json::to_string(&entry)?;
        let _: () = conn.rpush(&key, &payload).await?;
        if result_ttl_seconds > 0 {
            let _: () = conn.expire(&key, result_ttl_seconds as usize).await?;
        }
        Ok(true)
    }

    /// Administrative dead-letter requeue (§4.11): pop the stored job off
    /// the dead-letter list, mark it reprocessed, and push it back onto the
    /// primary ready queue.
    pub async fn requeue_dead_letter(
        &self,
        queue_name: &str,
        dead_letter_queue_name: &str,
        tenant_id: i64,
    ) -> anyhow::Result<Option<QueueJob>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = format!("{dead_letter_queue_name}:company_{tenant_id}");
        let raw: Option<String> = conn.lpop(&key, None).await?;
        let Some(raw) = raw else { return Ok(None) };
        let mut entry: DeadLetterJob = serde_json::from_str(&raw)?;
        entry.job.sent_to_dead_letter = false;
        entry.job.attempt = 0;
        entry.job.reprocessed_from_dead_letter = true;
        self.enqueue(queue_name, &entry.job).await?;
        Ok(Some(entry.job))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_exhausted_at_max_attempts() {
        let mut job = QueueJob::new(1, "5511999999999".into(), "oi".into(), MessageKind::Text, "corr-1".into(), 3);
        assert!(!job.retries_exhausted());
        job.attempt = 3;
        assert!(job.retries_exhausted());
    }

    #[test]
    fn dead_letter_job_serializes_with_reason() {
        let job = QueueJob::new(1, "5511999999999".into(), "oi".into(), MessageKind::Text, "corr-1".into(), 3);
        let entry = DeadLetterJob { job, reason: "gateway permanent failure".into() };
        let serialized = serde_json::to_string(&entry).unwrap();
        assert!(serialized.contains("gateway permanent failure"));
    }
}
