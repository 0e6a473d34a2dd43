//! In-process transport with scripted outcomes

use crate::error::TransportError;
use crate::transport::{DeliveryReceipt, MailTransport, OutgoingMail};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// What a single send attempt should do.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Deliver,
    Fail(TransportError),
    /// Sleep before delivering; used to trip caller deadlines.
    Stall(Duration),
}

/// Transport that records deliveries instead of talking to a relay.
///
/// Each attempt pops the next scripted outcome; once the script runs out the
/// fallback applies (deliver, unless built with [`RecordingTransport::failing`]).
#[derive(Clone)]
pub struct RecordingTransport {
    script: Arc<Mutex<VecDeque<ScriptedOutcome>>>,
    fallback: ScriptedOutcome,
    delivered: Arc<Mutex<Vec<OutgoingMail>>>,
    attempts: Arc<AtomicUsize>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::with_fallback(ScriptedOutcome::Deliver)
    }

    /// Every attempt fails with `error`.
    pub fn failing(error: TransportError) -> Self {
        Self::with_fallback(ScriptedOutcome::Fail(error))
    }

    fn with_fallback(fallback: ScriptedOutcome) -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            fallback,
            delivered: Arc::new(Mutex::new(Vec::new())),
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queue outcomes for the next attempts, in order.
    pub fn with_script(self, outcomes: impl IntoIterator<Item = ScriptedOutcome>) -> Self {
        // Not shared yet, so the lock is uncontended.
        if let Ok(mut script) = self.script.try_lock() {
            script.extend(outcomes);
        }
        self
    }

    pub async fn push(&self, outcome: ScriptedOutcome) {
        self.script.lock().await.push_back(outcome);
    }

    /// Number of send calls, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub async fn delivered(&self) -> Vec<OutgoingMail> {
        self.delivered.lock().await.clone()
    }

    pub async fn delivered_count(&self) -> usize {
        self.delivered.lock().await.len()
    }

    pub async fn was_sent_to(&self, address: &str) -> bool {
        self.delivered
            .lock()
            .await
            .iter()
            .any(|mail| mail.to.iter().any(|to| to == address))
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn send(&self, mail: &OutgoingMail) -> Result<DeliveryReceipt, TransportError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        let outcome = self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match outcome {
            ScriptedOutcome::Deliver => {}
            ScriptedOutcome::Fail(error) => return Err(error),
            ScriptedOutcome::Stall(duration) => tokio::time::sleep(duration).await,
        }

        self.delivered.lock().await.push(mail.clone());

        let message_id = mail
            .reference
            .clone()
            .unwrap_or_else(|| format!("recorded-{attempt}"));

        Ok(DeliveryReceipt { message_id })
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mail() -> OutgoingMail {
        OutgoingMail::new("ops@example.com", vec!["a@example.com".into()], "Hi", "Body")
    }

    #[tokio::test]
    async fn test_script_then_fallback() {
        let transport = RecordingTransport::new().with_script([
            ScriptedOutcome::Fail(TransportError::Deferred("451".into())),
            ScriptedOutcome::Deliver,
        ]);

        assert!(transport.send(&mail()).await.is_err());
        assert!(transport.send(&mail()).await.is_ok());
        assert!(transport.send(&mail()).await.is_ok());

        assert_eq!(transport.attempts(), 3);
        assert_eq!(transport.delivered_count().await, 2);
        assert!(transport.was_sent_to("a@example.com").await);
    }

    #[tokio::test]
    async fn test_failing_never_records() {
        let transport = RecordingTransport::failing(TransportError::Rejected("550".into()));

        let err = transport.send(&mail()).await.unwrap_err();

        assert_eq!(err, TransportError::Rejected("550".into()));
        assert_eq!(transport.delivered_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_delays_delivery() {
        let transport = RecordingTransport::new()
            .with_script([ScriptedOutcome::Stall(Duration::from_secs(5))]);

        let start = tokio::time::Instant::now();
        let receipt = transport
            .send(&mail().with_reference("rec-1"))
            .await
            .unwrap();

        assert!(start.elapsed() >= Duration::from_secs(5));
        assert_eq!(receipt.message_id, "rec-1");
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let transport = RecordingTransport::new();
        let handle = transport.clone();

        transport.send(&mail()).await.unwrap();

        assert_eq!(handle.attempts(), 1);
        assert_eq!(handle.delivered_count().await, 1);
    }
}
