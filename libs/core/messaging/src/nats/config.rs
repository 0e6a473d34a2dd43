//! Configuration for NATS JetStream workers.

use crate::config::{BackoffStrategy, RedeliveryPolicy};
use std::time::Duration;

/// Stream configuration trait (type-safe constants).
///
/// # Example
///
/// ```rust,ignore
/// struct InvoiceStream;
///
/// impl StreamConfig for InvoiceStream {
///     const STREAM_NAME: &'static str = "INVOICES";
///     const CONSUMER_NAME: &'static str = "invoice-worker";
///     const DLQ_STREAM: &'static str = "INVOICES_DLQ";
///     const SUBJECT: &'static str = "invoices.created";
/// }
/// ```
pub trait StreamConfig {
    /// JetStream stream name
    const STREAM_NAME: &'static str;

    /// Durable consumer name, shared by every worker instance
    const CONSUMER_NAME: &'static str;

    /// Dead letter stream name
    const DLQ_STREAM: &'static str;

    /// Subject the stream captures and the consumer filters on
    const SUBJECT: &'static str = ">";

    /// Maximum deliveries before dead-lettering (default: 3)
    const MAX_DELIVER: u32 = 3;

    /// Ack wait timeout in seconds (default: 30)
    const ACK_WAIT_SECS: u64 = 30;
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// JetStream stream name
    pub stream_name: String,

    /// Durable consumer name. Every instance binds the same consumer so each
    /// message is handed to one instance at a time.
    pub consumer_name: String,

    /// Subject to subscribe to
    pub subject: String,

    /// Dead letter stream name
    pub dlq_stream: String,

    /// Batch size for fetching messages
    pub batch_size: usize,

    /// How long a pull waits for messages
    pub fetch_timeout: Duration,

    /// Ack wait timeout; unacked messages are redelivered after this
    pub ack_wait: Duration,

    /// Maximum concurrently processed messages
    pub max_concurrent_jobs: usize,

    /// Delivery limit and nak backoff
    pub redelivery: RedeliveryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            stream_name: "JOBS".to_string(),
            consumer_name: "worker".to_string(),
            subject: ">".to_string(),
            dlq_stream: "JOBS_DLQ".to_string(),
            batch_size: 10,
            fetch_timeout: Duration::from_secs(5),
            ack_wait: Duration::from_secs(30),
            max_concurrent_jobs: 4,
            redelivery: RedeliveryPolicy::new(3),
        }
    }
}

impl WorkerConfig {
    /// Create from a StreamConfig trait.
    pub fn from_stream<S: StreamConfig>() -> Self {
        Self {
            stream_name: S::STREAM_NAME.to_string(),
            consumer_name: S::CONSUMER_NAME.to_string(),
            subject: S::SUBJECT.to_string(),
            dlq_stream: S::DLQ_STREAM.to_string(),
            ack_wait: Duration::from_secs(S::ACK_WAIT_SECS),
            redelivery: RedeliveryPolicy::new(S::MAX_DELIVER),
            ..Default::default()
        }
    }

    /// Messages pulled per fetch.
    ///
    /// Capped at `max_concurrent_jobs`: a batch is only fetched once the
    /// previous one settled, so every fetched message starts right away
    /// instead of ageing toward `ack_wait` while it waits for a slot.
    pub fn fetch_size(&self) -> usize {
        self.batch_size.min(self.max_concurrent_jobs).max(1)
    }

    /// How often a message still being processed gets an in-progress ack.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.ack_wait / 2).max(Duration::from_secs(1))
    }

    /// Set the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Set the fetch timeout.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Set the maximum concurrent jobs.
    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max.max(1);
        self
    }

    /// Set the nak backoff.
    pub fn with_redelivery_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.redelivery = self.redelivery.with_backoff(backoff);
        self
    }
}
