//! End-to-end delivery scenarios without external services.
//!
//! Creation events are captured from the publisher and handed to the
//! processor the way the worker does: through `process_delivery` with the
//! broker's delivery count, and `on_dead_letter` once a message is given up.

use async_trait::async_trait;
use domain_emails::*;
use email::{RecordingTransport, ScriptedOutcome, TransportError};
use messaging::{BackoffStrategy, Disposition, Processor, RedeliveryPolicy, process_delivery};
use std::sync::Arc;
use std::time::Duration;
use test_utils::TestDataBuilder;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Publisher standing in for the broker: keeps every acknowledged event.
#[derive(Default)]
struct CapturingPublisher {
    events: Mutex<Vec<CreationEvent>>,
}

impl CapturingPublisher {
    async fn take(&self) -> Vec<CreationEvent> {
        std::mem::take(&mut *self.events.lock().await)
    }
}

#[async_trait]
impl EventPublisher for CapturingPublisher {
    async fn publish(&self, event: &CreationEvent) -> EmailResult<u64> {
        let mut events = self.events.lock().await;
        events.push(event.clone());
        Ok(events.len() as u64)
    }
}

type Service =
    EmailService<InMemoryEmailStore, InMemoryEmailCache, CapturingPublisher, RecordingTransport>;
type Consumer = CreationEventProcessor<InMemoryEmailStore, InMemoryEmailCache, RecordingTransport>;

struct Harness {
    service: Service,
    processor: Consumer,
    publisher: Arc<CapturingPublisher>,
    transport: RecordingTransport,
    policy: RedeliveryPolicy,
}

fn harness(transport: RecordingTransport) -> Harness {
    let store = Arc::new(InMemoryEmailStore::new());
    let cache = Arc::new(InMemoryEmailCache::new());
    let publisher = Arc::new(CapturingPublisher::default());
    let pipeline = SendPipeline::new(
        transport.clone(),
        SendPolicy::new(1, Duration::from_millis(500), Duration::from_millis(1)),
    );

    let service = EmailService::new(
        store.clone(),
        cache.clone(),
        publisher.clone(),
        pipeline.clone(),
    );
    let processor = CreationEventProcessor::new(store, cache, pipeline, CancellationToken::new());

    Harness {
        service,
        processor,
        publisher,
        transport,
        policy: RedeliveryPolicy::new(5)
            .with_backoff(BackoffStrategy::Fixed(Duration::from_millis(10))),
    }
}

fn input(builder: &TestDataBuilder) -> CreateEmail {
    CreateEmail {
        from: builder.email("ops"),
        to: vec![builder.email("alice"), builder.email("bob")],
        subject: builder.text("subject", "welcome"),
        body: "Hello there".to_string(),
    }
}

/// Create and publish one email, returning its id and the captured event.
async fn create_published(h: &Harness, builder: &TestDataBuilder) -> (Uuid, CreationEvent) {
    let record = h.service.create(input(builder)).await.unwrap();
    let published = h.service.publish_create(record.id).await.unwrap();
    assert_eq!(published.status, EmailStatus::Published);

    let mut events = h.publisher.take().await;
    assert_eq!(events.len(), 1);
    (record.id, events.remove(0))
}

/// Deliver `event` up to `max_deliver` times, as the worker would.
async fn deliver_until_settled(h: &Harness, event: &CreationEvent) -> (Disposition, u32) {
    let mut delivery_count = 1;
    loop {
        let disposition = process_delivery(&h.processor, event, delivery_count, &h.policy).await;
        match disposition {
            Disposition::Redeliver { .. } => delivery_count += 1,
            Disposition::DeadLetter { ref reason } => {
                h.processor.on_dead_letter(event, reason).await;
                return (disposition, delivery_count);
            }
            Disposition::Ack => return (disposition, delivery_count),
        }
    }
}

#[tokio::test]
async fn test_published_email_is_sent_once() {
    let h = harness(RecordingTransport::new());
    let builder = TestDataBuilder::from_test_name("sent_once");
    let (id, event) = create_published(&h, &builder).await;

    let (disposition, deliveries) = deliver_until_settled(&h, &event).await;
    assert_eq!(disposition, Disposition::Ack);
    assert_eq!(deliveries, 1);

    let record = h.service.get_by_id(id).await.unwrap();
    assert_eq!(record.status, EmailStatus::Sent);
    assert!(record.updated_at >= record.created_at);

    let delivered = h.transport.delivered().await;
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].to, record.to);
    assert_eq!(delivered[0].reference.as_deref(), Some(id.to_string().as_str()));

    // A redelivery of the same event is acknowledged without sending again.
    let again = process_delivery(&h.processor, &event, 2, &h.policy).await;
    assert_eq!(again, Disposition::Ack);
    assert_eq!(h.transport.delivered_count().await, 1);
}

#[tokio::test]
async fn test_rejected_email_is_marked_failed_without_redelivery() {
    let h = harness(RecordingTransport::failing(TransportError::Rejected(
        "550 mailbox unavailable".into(),
    )));
    let builder = TestDataBuilder::from_test_name("rejected");
    let (id, event) = create_published(&h, &builder).await;

    let (disposition, deliveries) = deliver_until_settled(&h, &event).await;

    assert_eq!(disposition, Disposition::Ack);
    assert_eq!(deliveries, 1);
    assert_eq!(h.transport.attempts(), 1);
    assert_eq!(
        h.service.get_by_id(id).await.unwrap().status,
        EmailStatus::Failed
    );
}

#[tokio::test]
async fn test_transient_failures_exhaust_deliveries_then_fail() {
    let h = harness(RecordingTransport::failing(TransportError::Unavailable(
        "connection refused".into(),
    )));
    let builder = TestDataBuilder::from_test_name("transient");
    let (id, event) = create_published(&h, &builder).await;

    let (disposition, deliveries) = deliver_until_settled(&h, &event).await;

    assert!(matches!(disposition, Disposition::DeadLetter { .. }));
    assert_eq!(deliveries, 5);
    assert_eq!(h.transport.attempts(), 5);
    assert_eq!(
        h.service.get_by_id(id).await.unwrap().status,
        EmailStatus::Failed
    );
}

#[tokio::test]
async fn test_transient_failure_recovers_on_redelivery() {
    let transport = RecordingTransport::new().with_script([
        ScriptedOutcome::Fail(TransportError::Deferred("451 try later".into())),
        ScriptedOutcome::Fail(TransportError::Timeout),
    ]);
    let h = harness(transport);
    let builder = TestDataBuilder::from_test_name("recovers");
    let (id, event) = create_published(&h, &builder).await;

    let (disposition, deliveries) = deliver_until_settled(&h, &event).await;

    assert_eq!(disposition, Disposition::Ack);
    assert_eq!(deliveries, 3);
    assert_eq!(h.transport.delivered_count().await, 1);
    assert_eq!(
        h.service.get_by_id(id).await.unwrap().status,
        EmailStatus::Sent
    );
}

#[tokio::test]
async fn test_event_overtaking_status_update_still_sends() {
    let h = harness(RecordingTransport::new());
    let builder = TestDataBuilder::from_test_name("overtake");

    // The event reaches the consumer while the record is still pending.
    let record = h.service.create(input(&builder)).await.unwrap();
    let event = CreationEvent::from(&record);

    let (disposition, _) = deliver_until_settled(&h, &event).await;

    assert_eq!(disposition, Disposition::Ack);
    assert_eq!(
        h.service.get_by_id(record.id).await.unwrap().status,
        EmailStatus::Sent
    );

    // The late publish cannot move a finished record.
    assert!(matches!(
        h.service.publish_create(record.id).await,
        Err(EmailError::StaleState { .. })
    ));
}

#[tokio::test]
async fn test_event_for_unknown_email_is_dead_lettered() {
    let h = harness(RecordingTransport::new());
    let builder = TestDataBuilder::from_test_name("unknown");
    let record = EmailRecord::new(input(&builder));
    let event = CreationEvent::from(&record);

    let (disposition, deliveries) = deliver_until_settled(&h, &event).await;

    assert!(matches!(disposition, Disposition::DeadLetter { .. }));
    assert_eq!(deliveries, 1);
    assert_eq!(h.transport.attempts(), 0);
    assert!(matches!(
        h.service.get_by_id(record.id).await,
        Err(EmailError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_search_sees_final_statuses() {
    let h = harness(RecordingTransport::new());
    let builder = TestDataBuilder::from_test_name("search");

    for _ in 0..3 {
        let (_, event) = create_published(&h, &builder).await;
        deliver_until_settled(&h, &event).await;
    }

    let page = h
        .service
        .search(SearchQuery {
            search: Some(builder.email("alice")),
            cursor: None,
            limit: Some(10),
        })
        .await
        .unwrap();

    assert_eq!(page.total_count, 3);
    assert!(page.emails.iter().all(|e| e.status == EmailStatus::Sent));
}
