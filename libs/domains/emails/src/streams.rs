use messaging::nats::StreamConfig;

/// JetStream layout for email creation events.
///
/// One subject on one stream keeps events for a record in publish order.
pub struct EmailEventsStream;

impl StreamConfig for EmailEventsStream {
    const STREAM_NAME: &'static str = "EMAIL_EVENTS";
    const CONSUMER_NAME: &'static str = "email-sender";
    const DLQ_STREAM: &'static str = "EMAIL_EVENTS_DLQ";
    const SUBJECT: &'static str = "emails.created";
    const MAX_DELIVER: u32 = 5;
    const ACK_WAIT_SECS: u64 = 60;
}
