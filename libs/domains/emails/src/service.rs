use email::{DeliveryReceipt, MailTransport};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::cache::{CacheLookup, EmailCache};
use crate::error::{EmailError, EmailResult};
use crate::metrics;
use crate::models::{CreateEmail, CreationEvent, EmailPage, EmailRecord, EmailStatus, SearchQuery};
use crate::pipeline::SendPipeline;
use crate::publisher::EventPublisher;
use crate::store::EmailStore;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Email use cases: create, publish, read, search and manual send.
pub struct EmailService<S, C, P, T>
where
    S: EmailStore,
    C: EmailCache,
    P: EventPublisher,
    T: MailTransport,
{
    store: Arc<S>,
    cache: Arc<C>,
    publisher: Arc<P>,
    pipeline: SendPipeline<T>,
    cache_ttl: Duration,
    cancel: CancellationToken,
}

impl<S, C, P, T> Clone for EmailService<S, C, P, T>
where
    S: EmailStore,
    C: EmailCache,
    P: EventPublisher,
    T: MailTransport,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            cache: self.cache.clone(),
            publisher: self.publisher.clone(),
            pipeline: self.pipeline.clone(),
            cache_ttl: self.cache_ttl,
            cancel: self.cancel.clone(),
        }
    }
}

impl<S, C, P, T> EmailService<S, C, P, T>
where
    S: EmailStore,
    C: EmailCache,
    P: EventPublisher,
    T: MailTransport,
{
    pub fn new(store: Arc<S>, cache: Arc<C>, publisher: Arc<P>, pipeline: SendPipeline<T>) -> Self {
        Self {
            store,
            cache,
            publisher,
            pipeline,
            cache_ttl: DEFAULT_CACHE_TTL,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Token observed by manual sends; cancel it on shutdown.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Validate and persist a new `Pending` record.
    #[instrument(skip(self, input), fields(recipients = input.to.len()))]
    pub async fn create(&self, input: CreateEmail) -> EmailResult<EmailRecord> {
        input.validate()?;

        let record = self.store.upsert(EmailRecord::new(input)).await?;
        self.cache.invalidate(record.id).await;

        metrics::email_created();
        info!(email_id = %record.id, "Created email");
        Ok(record)
    }

    /// Publish the creation event of a stored record and mark it `Published`.
    ///
    /// A `Published` record may be published again; the broker drops the
    /// duplicate inside its window and the consumer skips finished records.
    /// On `PublishTimeout` the event may have been stored: call again.
    #[instrument(skip(self), fields(email_id = %id))]
    pub async fn publish_create(&self, id: Uuid) -> EmailResult<EmailRecord> {
        let mut record = self.store.get_by_id(id).await?;

        if record.status.is_terminal() {
            return Err(EmailError::StaleState {
                id,
                expected: EmailStatus::Pending,
                actual: record.status,
            });
        }

        let republish = record.status == EmailStatus::Published;
        let sequence = match self.publisher.publish(&CreationEvent::from(&record)).await {
            Ok(sequence) => sequence,
            Err(e) => {
                metrics::publish_failed(if e.is_retryable() { "timeout" } else { "rejected" });
                warn!(error = %e, "Failed to publish creation event");
                return Err(e);
            }
        };
        metrics::event_published(republish);

        if record.status == EmailStatus::Pending {
            match self
                .store
                .update_status(id, EmailStatus::Pending, EmailStatus::Published)
                .await
            {
                Ok(updated) => record = updated,
                // The event is durable; the consumer promotes the record if
                // this write never lands.
                Err(e) => warn!(error = %e, sequence, "Event published but status update failed"),
            }
        }
        self.cache.invalidate(id).await;

        info!(sequence, republish, "Published creation event");
        Ok(record)
    }

    /// Cache-aside point lookup.
    #[instrument(skip(self), fields(email_id = %id))]
    pub async fn get_by_id(&self, id: Uuid) -> EmailResult<EmailRecord> {
        let version = match self.cache.get(id).await {
            CacheLookup::Hit(record) => {
                metrics::cache_lookup(true);
                return Ok(record);
            }
            CacheLookup::Miss(version) => version,
        };
        metrics::cache_lookup(false);

        // Skipped by the cache if a transition invalidated `id` meanwhile.
        let record = self.store.get_by_id(id).await?;
        self.cache.set(&record, version, self.cache_ttl).await;
        Ok(record)
    }

    /// Search the store; results are never cached.
    pub async fn search(&self, query: SearchQuery) -> EmailResult<EmailPage> {
        query.validate()?;
        self.store.search(&query).await
    }

    /// Send a record right away through the send pipeline, without touching
    /// the stream or the record's status.
    #[instrument(skip(self, record), fields(email_id = %record.id))]
    pub async fn send_email(&self, record: &EmailRecord) -> EmailResult<DeliveryReceipt> {
        let receipt = self.pipeline.send(&record.to_mail(), &self.cancel).await?;
        debug!(message_id = %receipt.message_id, "Manual send accepted");
        Ok(receipt)
    }
}
