use async_trait::async_trait;
use messaging::nats::{NatsError, NatsProducer};

use crate::error::{EmailError, EmailResult};
use crate::models::CreationEvent;

/// Publishes creation events with a durable broker acknowledgement.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Returns the stream sequence assigned by the broker.
    ///
    /// `PublishTimeout` means the outcome is unknown: the event may have been
    /// stored. Re-check the record before retrying.
    async fn publish(&self, event: &CreationEvent) -> EmailResult<u64>;
}

/// [`EventPublisher`] over a JetStream producer bound to
/// [`EmailEventsStream`](crate::EmailEventsStream).
#[derive(Clone)]
pub struct NatsEventPublisher {
    producer: NatsProducer,
}

impl NatsEventPublisher {
    pub fn new(producer: NatsProducer) -> Self {
        Self { producer }
    }
}

pub(crate) fn map_publish_error(err: NatsError) -> EmailError {
    if err.is_timeout() {
        EmailError::PublishTimeout(err.to_string())
    } else if err.is_rejected() {
        EmailError::PublishRejected(err.to_string())
    } else {
        // Connection drops and unacked publishes: the event may or may not
        // have landed, same as a timeout.
        EmailError::PublishTimeout(err.to_string())
    }
}

#[async_trait]
impl EventPublisher for NatsEventPublisher {
    async fn publish(&self, event: &CreationEvent) -> EmailResult<u64> {
        let sequence = self
            .producer
            .publish(event)
            .await
            .map_err(map_publish_error)?;

        tracing::debug!(
            email_id = %event.email_id,
            sequence,
            subject = %self.producer.subject(),
            "Creation event acknowledged"
        );
        Ok(sequence)
    }
}
