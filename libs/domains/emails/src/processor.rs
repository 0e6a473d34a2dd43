//! Consumer side: turns creation events into sends and terminal statuses.

use async_trait::async_trait;
use database::common::{RetryConfig, retry_with_backoff_if};
use email::MailTransport;
use messaging::{ProcessingError, Processor};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::EmailCache;
use crate::error::EmailError;
use crate::metrics;
use crate::models::{CreationEvent, EmailStatus};
use crate::pipeline::SendPipeline;
use crate::store::EmailStore;

/// [`Processor`] for [`CreationEvent`]s.
///
/// Idempotent per record: terminal records are skipped, and every status
/// change is conditional so concurrent redeliveries cannot regress a record.
pub struct CreationEventProcessor<S, C, T>
where
    S: EmailStore,
    C: EmailCache,
    T: MailTransport,
{
    store: Arc<S>,
    cache: Arc<C>,
    pipeline: SendPipeline<T>,
    cancel: CancellationToken,
    status_retry: RetryConfig,
}

impl<S, C, T> CreationEventProcessor<S, C, T>
where
    S: EmailStore,
    C: EmailCache,
    T: MailTransport,
{
    pub fn new(
        store: Arc<S>,
        cache: Arc<C>,
        pipeline: SendPipeline<T>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            cache,
            pipeline,
            cancel,
            status_retry: RetryConfig::default(),
        }
    }

    /// Backoff for status writes hitting an unavailable store.
    pub fn with_status_retry(mut self, config: RetryConfig) -> Self {
        self.status_retry = config;
        self
    }

    /// Conditional status write, retried while the store is unavailable.
    async fn transition(
        &self,
        id: Uuid,
        from: EmailStatus,
        to: EmailStatus,
    ) -> Result<(), EmailError> {
        let result = retry_with_backoff_if(
            || self.store.update_status(id, from, to),
            self.status_retry.clone(),
            EmailError::is_retryable,
        )
        .await;

        // Any write attempt may have landed.
        self.cache.invalidate(id).await;
        result.map(|_| ())
    }

    /// Record the terminal outcome of a send.
    async fn finish(&self, id: Uuid, to: EmailStatus) -> Result<(), ProcessingError> {
        match self.transition(id, EmailStatus::Published, to).await {
            Ok(()) => {
                metrics::delivery_finished(to.as_str());
                info!(email_id = %id, status = %to, "Delivery finished");
                Ok(())
            }
            Err(EmailError::StaleState { actual, .. }) if actual.is_terminal() => {
                // Another delivery of the same event got there first.
                warn!(email_id = %id, status = %actual, "Record already finished");
                Ok(())
            }
            Err(e) => Err(to_processing_error(e)),
        }
    }
}

fn to_processing_error(err: EmailError) -> ProcessingError {
    if err.is_retryable() {
        ProcessingError::transient_with_source(err.to_string(), err)
    } else {
        ProcessingError::permanent_with_source(err.to_string(), err)
    }
}

#[async_trait]
impl<S, C, T> Processor<CreationEvent> for CreationEventProcessor<S, C, T>
where
    S: EmailStore + 'static,
    C: EmailCache + 'static,
    T: MailTransport + 'static,
{
    async fn process(&self, event: &CreationEvent) -> Result<(), ProcessingError> {
        let id = event.email_id;

        let record = match self.store.get_by_id(id).await {
            Ok(record) => record,
            Err(EmailError::NotFound(_)) => {
                return Err(ProcessingError::permanent(format!(
                    "email {id} does not exist"
                )));
            }
            Err(e) => return Err(to_processing_error(e)),
        };

        if record.status.is_terminal() {
            metrics::duplicate_skipped();
            debug!(email_id = %id, status = %record.status, "Skipping finished record");
            return Ok(());
        }

        if record.status == EmailStatus::Pending {
            // The event overtook the publisher's own status update.
            match self
                .transition(id, EmailStatus::Pending, EmailStatus::Published)
                .await
            {
                Ok(()) => debug!(email_id = %id, "Promoted pending record"),
                Err(EmailError::StaleState { actual, .. }) if actual.is_terminal() => {
                    metrics::duplicate_skipped();
                    return Ok(());
                }
                Err(EmailError::StaleState { .. }) => {}
                Err(e) => return Err(to_processing_error(e)),
            }
        }

        match self.pipeline.send(&event.to_mail(), &self.cancel).await {
            Ok(receipt) => {
                debug!(email_id = %id, message_id = %receipt.message_id, "Mail accepted");
                self.finish(id, EmailStatus::Sent).await
            }
            Err(EmailError::Permanent(reason)) => {
                warn!(email_id = %id, error = %reason, "Mail rejected, marking failed");
                self.finish(id, EmailStatus::Failed).await
            }
            Err(e) => Err(ProcessingError::transient_with_source(e.to_string(), e)),
        }
    }

    fn name(&self) -> &'static str {
        "email-sender"
    }

    async fn health_check(&self) -> Result<bool, ProcessingError> {
        Ok(self.pipeline.transport().health_check().await.is_ok())
    }

    async fn on_dead_letter(&self, event: &CreationEvent, reason: &str) {
        let id = event.email_id;

        let status = match self.store.get_by_id(id).await {
            Ok(record) => record.status,
            Err(e) => {
                error!(email_id = %id, error = %e, reason, "Cannot mark dead-lettered email failed");
                return;
            }
        };

        if status.is_terminal() {
            return;
        }

        if status == EmailStatus::Pending {
            match self
                .transition(id, EmailStatus::Pending, EmailStatus::Published)
                .await
            {
                Ok(()) | Err(EmailError::StaleState { .. }) => {}
                Err(e) => {
                    error!(email_id = %id, error = %e, "Cannot promote dead-lettered email");
                    return;
                }
            }
        }

        match self.finish(id, EmailStatus::Failed).await {
            Ok(()) => warn!(email_id = %id, reason, "Email dead-lettered and marked failed"),
            Err(e) => error!(email_id = %id, error = %e, reason, "Failed to mark dead-lettered email"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{InMemoryEmailCache, MockEmailCache};
    use crate::memory::InMemoryEmailStore;
    use crate::models::{CreateEmail, EmailRecord};
    use crate::pipeline::SendPolicy;
    use crate::store::MockEmailStore;
    use email::{RecordingTransport, TransportError};
    use messaging::ErrorCategory;
    use std::time::Duration;

    fn record() -> EmailRecord {
        EmailRecord::new(CreateEmail {
            from: "ops@example.com".to_string(),
            to: vec!["a@b.com".to_string()],
            subject: "hi".to_string(),
            body: "body".to_string(),
        })
    }

    fn policy() -> SendPolicy {
        SendPolicy::new(2, Duration::from_millis(200), Duration::from_millis(1))
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig::new()
            .with_max_retries(2)
            .with_initial_delay(1)
            .without_jitter()
    }

    async fn seeded(
        status: EmailStatus,
        transport: RecordingTransport,
    ) -> (
        InMemoryEmailStore,
        EmailRecord,
        CreationEventProcessor<InMemoryEmailStore, InMemoryEmailCache, RecordingTransport>,
    ) {
        let store = InMemoryEmailStore::new();
        let record = store.upsert(record()).await.unwrap();
        if status != EmailStatus::Pending {
            store
                .update_status(record.id, EmailStatus::Pending, EmailStatus::Published)
                .await
                .unwrap();
        }
        if status.is_terminal() {
            store
                .update_status(record.id, EmailStatus::Published, status)
                .await
                .unwrap();
        }

        let processor = CreationEventProcessor::new(
            Arc::new(store.clone()),
            Arc::new(InMemoryEmailCache::new()),
            SendPipeline::new(transport, policy()),
            CancellationToken::new(),
        )
        .with_status_retry(fast_retry());

        (store, record, processor)
    }

    #[tokio::test]
    async fn test_success_marks_sent() {
        let transport = RecordingTransport::new();
        let (store, record, processor) = seeded(EmailStatus::Published, transport.clone()).await;

        processor.process(&CreationEvent::from(&record)).await.unwrap();

        assert_eq!(
            store.get_by_id(record.id).await.unwrap().status,
            EmailStatus::Sent
        );
        assert_eq!(transport.delivered_count().await, 1);
    }

    #[tokio::test]
    async fn test_redelivery_after_sent_sends_once() {
        let transport = RecordingTransport::new();
        let (_store, record, processor) =
            seeded(EmailStatus::Published, transport.clone()).await;
        let event = CreationEvent::from(&record);

        processor.process(&event).await.unwrap();
        processor.process(&event).await.unwrap();

        assert_eq!(transport.attempts(), 1);
    }

    #[tokio::test]
    async fn test_pending_record_is_promoted_then_sent() {
        let transport = RecordingTransport::new();
        let (store, record, processor) = seeded(EmailStatus::Pending, transport).await;

        processor.process(&CreationEvent::from(&record)).await.unwrap();

        assert_eq!(
            store.get_by_id(record.id).await.unwrap().status,
            EmailStatus::Sent
        );
    }

    #[tokio::test]
    async fn test_permanent_failure_marks_failed_and_acks() {
        let transport = RecordingTransport::failing(TransportError::Rejected("550".into()));
        let (store, record, processor) = seeded(EmailStatus::Published, transport).await;

        processor.process(&CreationEvent::from(&record)).await.unwrap();

        assert_eq!(
            store.get_by_id(record.id).await.unwrap().status,
            EmailStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_transient_failure_is_redelivered() {
        let transport = RecordingTransport::failing(TransportError::Timeout);
        let (store, record, processor) = seeded(EmailStatus::Published, transport).await;

        let err = processor
            .process(&CreationEvent::from(&record))
            .await
            .unwrap_err();

        assert_eq!(err.category(), ErrorCategory::Transient);
        assert_eq!(
            store.get_by_id(record.id).await.unwrap().status,
            EmailStatus::Published
        );
    }

    #[tokio::test]
    async fn test_canceled_send_is_transient() {
        let transport = RecordingTransport::new();
        let (_store, record, processor) = seeded(EmailStatus::Published, transport.clone()).await;
        processor.cancel.cancel();

        let err = processor
            .process(&CreationEvent::from(&record))
            .await
            .unwrap_err();

        assert_eq!(err.category(), ErrorCategory::Transient);
        assert_eq!(transport.attempts(), 0);
    }

    #[tokio::test]
    async fn test_missing_record_is_permanent() {
        let transport = RecordingTransport::new();
        let (_store, _record, processor) = seeded(EmailStatus::Published, transport).await;

        let err = processor
            .process(&CreationEvent::from(&record()))
            .await
            .unwrap_err();

        assert_eq!(err.category(), ErrorCategory::Permanent);
    }

    #[tokio::test]
    async fn test_dead_letter_marks_failed() {
        let transport = RecordingTransport::new();
        let (store, record, processor) = seeded(EmailStatus::Pending, transport).await;

        processor
            .on_dead_letter(&CreationEvent::from(&record), "delivery limit reached")
            .await;

        assert_eq!(
            store.get_by_id(record.id).await.unwrap().status,
            EmailStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_store_outage_during_status_write_is_retried() {
        let stored = record();
        let published = EmailRecord {
            status: EmailStatus::Published,
            ..stored.clone()
        };
        let sent = EmailRecord {
            status: EmailStatus::Sent,
            ..stored.clone()
        };

        let mut store = MockEmailStore::new();
        store
            .expect_get_by_id()
            .returning(move |_| Ok(published.clone()));
        let mut calls = 0;
        store
            .expect_update_status()
            .withf(|_, from, to| *from == EmailStatus::Published && *to == EmailStatus::Sent)
            .times(2)
            .returning(move |_, _, _| {
                calls += 1;
                if calls == 1 {
                    Err(EmailError::StoreUnavailable("connection reset".into()))
                } else {
                    Ok(sent.clone())
                }
            });

        let mut cache = MockEmailCache::new();
        cache.expect_invalidate().times(1).return_const(());

        let processor = CreationEventProcessor::new(
            Arc::new(store),
            Arc::new(cache),
            SendPipeline::new(RecordingTransport::new(), policy()),
            CancellationToken::new(),
        )
        .with_status_retry(fast_retry());

        processor.process(&CreationEvent::from(&stored)).await.unwrap();
    }
}
