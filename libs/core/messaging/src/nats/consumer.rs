//! NATS JetStream pull consumer.

use crate::nats::config::WorkerConfig;
use crate::nats::error::NatsError;
use crate::Job;
use async_nats::jetstream::consumer::pull::Config as ConsumerConfig;
use async_nats::jetstream::consumer::{AckPolicy, Consumer};
use async_nats::jetstream::stream::Config as StreamConfig;
use async_nats::jetstream::{AckKind, Context, Message};
use futures::StreamExt;
use std::time::Duration;
use tracing::{info, warn};

/// Durable pull consumer bound to one stream and subject.
pub struct NatsConsumer {
    consumer: Consumer<ConsumerConfig>,
    config: WorkerConfig,
}

impl NatsConsumer {
    /// Ensure the stream and the durable consumer exist, then bind to it.
    pub async fn init(jetstream: &Context, config: WorkerConfig) -> Result<Self, NatsError> {
        let stream = jetstream
            .get_or_create_stream(StreamConfig {
                name: config.stream_name.clone(),
                subjects: vec![config.subject.clone()],
                max_messages: 100_000,
                max_age: Duration::from_secs(7 * 24 * 60 * 60), // 7 days
                duplicate_window: Duration::from_secs(2 * 60),
                ..Default::default()
            })
            .await
            .map_err(NatsError::from_jetstream_error)?;

        let consumer = stream
            .get_or_create_consumer(
                &config.consumer_name,
                ConsumerConfig {
                    durable_name: Some(config.consumer_name.clone()),
                    name: Some(config.consumer_name.clone()),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: config.ack_wait,
                    max_deliver: i64::from(config.redelivery.max_deliver),
                    filter_subject: config.subject.clone(),
                    ..Default::default()
                },
            )
            .await
            .map_err(NatsError::from_jetstream_error)?;

        info!(
            stream = %config.stream_name,
            consumer = %config.consumer_name,
            subject = %config.subject,
            "Consumer bound"
        );

        Ok(Self { consumer, config })
    }

    /// Fetch up to `batch_size` messages, waiting at most the fetch timeout.
    ///
    /// Messages whose payload does not decode as `J` are returned as
    /// [`Delivery::Poison`] so the worker can record them before acking.
    pub async fn fetch<J: Job>(&self, batch_size: usize) -> Result<Vec<Delivery<J>>, NatsError> {
        let mut messages = self
            .consumer
            .fetch()
            .max_messages(batch_size)
            .expires(self.config.fetch_timeout)
            .messages()
            .await
            .map_err(NatsError::from_jetstream_error)?;

        let mut result = Vec::new();

        while let Some(msg) = messages.next().await {
            let message = match msg {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "Error receiving message");
                    continue;
                }
            };

            let (sequence, delivery_count) = match message.info() {
                Ok(info) => (
                    info.stream_sequence,
                    u32::try_from(info.delivered).unwrap_or(u32::MAX),
                ),
                Err(e) => {
                    warn!(error = %e, "Failed to get message info, using defaults");
                    (0, 1)
                }
            };

            match serde_json::from_slice::<J>(&message.payload) {
                Ok(job) => result.push(Delivery::Job(NatsMessage {
                    job,
                    message,
                    sequence,
                    delivery_count,
                })),
                Err(e) => result.push(Delivery::Poison(PoisonMessage {
                    error: e.to_string(),
                    message,
                    sequence,
                    delivery_count,
                })),
            }
        }

        Ok(result)
    }
}

/// A fetched message: either a decoded job or an undecodable payload.
pub enum Delivery<J: Job> {
    Job(NatsMessage<J>),
    Poison(PoisonMessage),
}

/// A message received from NATS with metadata.
pub struct NatsMessage<J: Job> {
    /// The deserialized job.
    pub job: J,
    message: Message,
    /// Stream sequence number.
    pub sequence: u64,
    /// Number of delivery attempts, starting at 1.
    pub delivery_count: u32,
}

impl<J: Job> NatsMessage<J> {
    pub fn job_id(&self) -> String {
        self.job.job_id()
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }

    /// Acknowledge the message (successful processing).
    pub async fn ack(self) -> Result<(), NatsError> {
        ack_with(&self.message, AckKind::Ack).await
    }

    /// Reset the ack deadline while processing is still under way.
    pub async fn in_progress(&self) -> Result<(), NatsError> {
        ack_with(&self.message, AckKind::Progress).await
    }

    /// Negative acknowledge with delay.
    pub async fn nak_with_delay(self, delay: Duration) -> Result<(), NatsError> {
        ack_with(&self.message, AckKind::Nak(Some(delay))).await
    }

    /// Mark as permanently failed (won't be redelivered).
    pub async fn term(self) -> Result<(), NatsError> {
        ack_with(&self.message, AckKind::Term).await
    }
}

/// A message whose payload could not be decoded.
pub struct PoisonMessage {
    /// Decode error.
    pub error: String,
    message: Message,
    pub sequence: u64,
    pub delivery_count: u32,
}

impl PoisonMessage {
    pub fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    pub fn subject(&self) -> &str {
        self.message.subject.as_str()
    }

    pub async fn ack(self) -> Result<(), NatsError> {
        ack_with(&self.message, AckKind::Ack).await
    }
}

async fn ack_with(message: &Message, kind: AckKind) -> Result<(), NatsError> {
    message
        .ack_with(kind)
        .await
        .map_err(|e| NatsError::consumer_error(e.to_string()))
}
