//! Error types for NATS operations.

use crate::ErrorCategory;
use thiserror::Error;

/// Error that can occur in NATS producer/consumer/worker operations.
#[derive(Debug, Error)]
pub enum NatsError {
    /// NATS connection error
    #[error("NATS connection error: {0}")]
    Connection(#[from] async_nats::ConnectError),

    /// JetStream error
    #[error("JetStream error: {0}")]
    JetStream(String),

    /// Consumer error
    #[error("Consumer error: {0}")]
    Consumer(String),

    /// Publish error
    #[error("Publish error: {0}")]
    Publish(String),

    /// Payload exceeds the server's maximum message size
    #[error("payload of {size} bytes exceeds max payload of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// No stream captures the subject
    #[error("Stream not found: {0}")]
    StreamNotFound(String),
}

impl NatsError {
    /// Get the error category for retry decisions.
    pub fn category(&self) -> ErrorCategory {
        match self {
            NatsError::Connection(_) => ErrorCategory::Transient,
            NatsError::Timeout(_) => ErrorCategory::Transient,
            NatsError::JetStream(_) => ErrorCategory::Transient,
            NatsError::Consumer(_) => ErrorCategory::Transient,
            NatsError::Publish(_) => ErrorCategory::Transient,

            NatsError::PayloadTooLarge { .. } => ErrorCategory::Permanent,
            NatsError::Serialization(_) => ErrorCategory::Permanent,
            NatsError::StreamNotFound(_) => ErrorCategory::Permanent,
        }
    }

    /// Whether the broker can never accept this message as-is.
    pub fn is_rejected(&self) -> bool {
        self.category() == ErrorCategory::Permanent
    }

    /// Whether the publish outcome is unknown (it may have been stored).
    pub fn is_timeout(&self) -> bool {
        matches!(self, NatsError::Timeout(_))
    }

    /// Create a JetStream error from an async_nats error.
    pub fn from_jetstream_error(error: impl std::fmt::Display) -> Self {
        Self::JetStream(error.to_string())
    }

    /// Create a publish error.
    pub fn publish_error(msg: impl Into<String>) -> Self {
        Self::Publish(msg.into())
    }

    /// Create a consumer error.
    pub fn consumer_error(msg: impl Into<String>) -> Self {
        Self::Consumer(msg.into())
    }
}

impl From<async_nats::jetstream::context::PublishError> for NatsError {
    fn from(error: async_nats::jetstream::context::PublishError) -> Self {
        use async_nats::jetstream::context::PublishErrorKind;

        match error.kind() {
            PublishErrorKind::TimedOut => NatsError::Timeout(error.to_string()),
            PublishErrorKind::StreamNotFound => NatsError::StreamNotFound(error.to_string()),
            _ => NatsError::publish_error(error.to_string()),
        }
    }
}
