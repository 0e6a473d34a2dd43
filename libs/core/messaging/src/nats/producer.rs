//! NATS JetStream producer for publishing jobs.

use crate::nats::config::StreamConfig;
use crate::nats::error::NatsError;
use crate::Job;
use async_nats::header::NATS_MESSAGE_ID;
use async_nats::jetstream::Context;
use async_nats::HeaderMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// NATS server default `max_payload`.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Producer for publishing jobs to NATS JetStream.
///
/// Every publish waits for the stream's durable ack and carries the job id as
/// `Nats-Msg-Id`, so a retried publish inside the stream's duplicate window is
/// stored once.
#[derive(Clone)]
pub struct NatsProducer {
    jetstream: Arc<Context>,
    stream_name: String,
    subject: String,
    ack_timeout: Duration,
    max_payload: usize,
}

impl NatsProducer {
    /// Create a producer from a StreamConfig.
    pub fn from_stream_config<S: StreamConfig>(jetstream: Context) -> Self {
        Self {
            jetstream: Arc::new(jetstream),
            stream_name: S::STREAM_NAME.to_string(),
            subject: S::SUBJECT.to_string(),
            ack_timeout: Duration::from_secs(5),
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    /// Set how long to wait for the broker's durable ack.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Set the maximum payload size, usually from the server's INFO.
    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Publish a job and wait for the durable ack.
    ///
    /// Returns the stream sequence of the stored message.
    pub async fn publish<J: Job>(&self, job: &J) -> Result<u64, NatsError> {
        let payload = serde_json::to_vec(job)?;
        if payload.len() > self.max_payload {
            return Err(NatsError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload,
            });
        }

        let job_id = job.job_id();
        let mut headers = HeaderMap::new();
        headers.insert(NATS_MESSAGE_ID, job_id.as_str());

        let publish = async {
            let ack = self
                .jetstream
                .publish_with_headers(self.subject.clone(), headers, payload.into())
                .await?
                .await?;
            Ok::<_, NatsError>(ack)
        };

        let ack = tokio::time::timeout(self.ack_timeout, publish)
            .await
            .map_err(|_| {
                NatsError::Timeout(format!(
                    "no ack from stream {} within {:?}",
                    self.stream_name, self.ack_timeout
                ))
            })??;

        if ack.duplicate {
            warn!(
                stream = %self.stream_name,
                job_id = %job_id,
                sequence = ack.sequence,
                "Publish de-duplicated by stream"
            );
        } else {
            debug!(
                stream = %self.stream_name,
                subject = %self.subject,
                sequence = ack.sequence,
                job_id = %job_id,
                "Published job"
            );
        }

        Ok(ack.sequence)
    }
}
