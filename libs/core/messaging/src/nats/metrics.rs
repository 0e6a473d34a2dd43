//! Prometheus metrics for NATS worker.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Metrics for NATS worker.
#[derive(Clone)]
pub struct NatsMetrics {
    stream_name: String,
    processor_name: String,
}

impl NatsMetrics {
    pub fn new(stream_name: &str, processor_name: &str) -> Self {
        Self {
            stream_name: stream_name.to_string(),
            processor_name: processor_name.to_string(),
        }
    }

    /// Record a job received.
    pub fn job_received(&self) {
        counter!(
            "nats_worker_jobs_received_total",
            "stream" => self.stream_name.clone(),
            "processor" => self.processor_name.clone()
        )
        .increment(1);
    }

    /// Record a job acked after processing.
    pub fn job_processed(&self, duration: Duration) {
        counter!(
            "nats_worker_jobs_processed_total",
            "stream" => self.stream_name.clone(),
            "processor" => self.processor_name.clone()
        )
        .increment(1);

        histogram!(
            "nats_worker_job_duration_seconds",
            "stream" => self.stream_name.clone(),
            "processor" => self.processor_name.clone()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a job nak'd for redelivery.
    pub fn job_retried(&self) {
        counter!(
            "nats_worker_jobs_retried_total",
            "stream" => self.stream_name.clone(),
            "processor" => self.processor_name.clone()
        )
        .increment(1);
    }

    /// Record a job moved to DLQ.
    pub fn job_moved_to_dlq(&self) {
        counter!(
            "nats_worker_jobs_moved_to_dlq_total",
            "stream" => self.stream_name.clone(),
            "processor" => self.processor_name.clone()
        )
        .increment(1);
    }

    /// Record an undecodable message.
    pub fn poison_message(&self) {
        counter!(
            "nats_worker_poison_messages_total",
            "stream" => self.stream_name.clone()
        )
        .increment(1);
    }

    /// Record a failed ack/nak/term or DLQ write.
    pub fn settle_failed(&self, action: &'static str) {
        counter!(
            "nats_worker_settle_failures_total",
            "stream" => self.stream_name.clone(),
            "action" => action
        )
        .increment(1);
    }
}

/// Install the global Prometheus recorder.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}
