use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

/// Process-wide Prometheus registry shared by `webhook-gateway` and
/// `message-worker`, covering every series named in §6. One `Registry`,
/// one struct field per series, a `render()` that text-encodes the lot —
/// the same shape as a single-service metrics builder, just with both
/// binaries' series registered on it.
#[derive(Clone)]
pub struct WaMetrics {
    registry: Registry,
    pub webhook_received_total: IntCounterVec,
    pub task_latency_seconds: Histogram,
    pub queue_size: IntGaugeVec,
    pub dead_letter_queue_size: IntGaugeVec,
    pub whaticket_latency_seconds: Histogram,
    pub whaticket_errors_total: IntCounter,
    pub whaticket_send_retry_total: IntCounter,
    pub whaticket_send_success_total: IntCounter,
    pub llm_latency_seconds: Histogram,
    pub llm_errors_total: IntCounter,
    pub llm_error_rate: prometheus::GaugeVec,
    pub llm_prompt_injection_blocked_total: IntCounter,
    pub healthcheck_failures_total: IntCounterVec,
}

impl WaMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let webhook_received_total = IntCounterVec::new(
            Opts::new("webhook_received_total", "Inbound webhook requests by outcome"),
            &["company", "status"],
        )?;
        let task_latency_seconds = Histogram::with_opts(
            HistogramOpts::new("task_latency_seconds", "Worker task end-to-end latency")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0]),
        )?;
        let queue_size = IntGaugeVec::new(Opts::new("queue_size", "Ready-queue depth per tenant"), &["company"])?;
        let dead_letter_queue_size =
            IntGaugeVec::new(Opts::new("dead_letter_queue_size", "Dead-letter queue depth per tenant"), &["company"])?;
        let whaticket_latency_seconds = Histogram::with_opts(
            HistogramOpts::new("whaticket_latency_seconds", "Gateway send latency")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;
        let whaticket_errors_total = IntCounter::new("whaticket_errors_total", "Gateway send failures")?;
        let whaticket_send_retry_total =
            IntCounter::new("whaticket_send_retry_total", "Gateway send retries attempted")?;
        let whaticket_send_success_total =
            IntCounter::new("whaticket_send_success_total", "Gateway sends that succeeded")?;
        let llm_latency_seconds = Histogram::with_opts(
            HistogramOpts::new("llm_latency_seconds", "LLM call latency")
                .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0]),
        )?;
        let llm_errors_total = IntCounter::new("llm_errors_total", "LLM call failures")?;
        let llm_error_rate = prometheus::GaugeVec::new(
            Opts::new("llm_error_rate", "LLM error rate, failure / (success + failure)"),
            &["company"],
        )?;
        let llm_prompt_injection_blocked_total = IntCounter::new(
            "llm_prompt_injection_blocked_total",
            "Requests short-circuited by the prompt-injection guard",
        )?;
        let healthcheck_failures_total = IntCounterVec::new(
            Opts::new("healthcheck_failures_total", "Healthcheck dependency failures"),
            &["component"],
        )?;

        registry.register(Box::new(webhook_received_total.clone()))?;
        registry.register(Box::new(task_latency_seconds.clone()))?;
        registry.register(Box::new(queue_size.clone()))?;
        registry.register(Box::new(dead_letter_queue_size.clone()))?;
        registry.register(Box::new(whaticket_latency_seconds.clone()))?;
        registry.register(Box::new(whaticket_errors_total.clone()))?;
        registry.register(Box::new(whaticket_send_retry_total.clone()))?;
        registry.register(Box::new(whaticket_send_success_total.clone()))?;
        registry.register(Box::new(llm_latency_seconds.clone()))?;
        registry.register(Box::new(llm_errors_total.clone()))?;
        registry.register(Box::new(llm_error_rate.clone()))?;
        registry.register(Box::new(llm_prompt_injection_blocked_total.clone()))?;
        registry.register(Box::new(healthcheck_failures_total.clone()))?;

        Ok(Self {
            registry,
            webhook_received_total,
            task_latency_seconds,
            queue_size,
            dead_letter_queue_size,
            whaticket_latency_seconds,
            whaticket_errors_total,
            whaticket_send_retry_total,
            whaticket_send_success_total,
            llm_latency_seconds,
            llm_errors_total,
            llm_error_rate,
            llm_prompt_injection_blocked_total,
            healthcheck_failures_total,
        })
    }

    pub fn record_webhook(&self, company: &str, status: &str) {
        self.webhook_received_total.with_label_values(&[company, status]).inc();
    }

    pub fn set_llm_error_rate(&self, company: &str, successes: u64, failures: u64) {
        let total = successes + failures;
        let rate = if total == 0 { 0.0 } else { failures as f64 / total as f64 };
        self.llm_error_rate.with_label_values(&[company]).set(rate);
    }

    pub fn render(&self) -> anyhow::Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_rate_is_zero_with_no_samples() {
        let metrics = WaMetrics::new().unwrap();
        metrics.set_llm_error_rate("acme", 0, 0);
        let rendered = String::from_utf8(metrics.render().unwrap()).unwrap();
        assert!(rendered.contains("llm_error_rate"));
    }

    #[test]
    fn webhook_counter_increments_per_label_combo() {
        let metrics = WaMetrics::new().unwrap();
        metrics.record_webhook("acme", "accepted");
        metrics.record_webhook("acme", "accepted");
        metrics.record_webhook("acme", "rejected");
        assert_eq!(metrics.webhook_received_total.with_label_values(&["acme", "accepted"]).get(), 2);
        assert_eq!(metrics.webhook_received_total.with_label_values(&["acme", "rejected"]).get(), 1);
    }
}
