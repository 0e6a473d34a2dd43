use crate::error::TransportError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A message ready to hand to a relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMail {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    /// Stable identifier used as the `Message-ID` local part, so a resend of
    /// the same record can be recognised downstream.
    pub reference: Option<String>,
}

impl OutgoingMail {
    pub fn new(
        from: impl Into<String>,
        to: Vec<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to,
            subject: subject.into(),
            body: body.into(),
            reference: None,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }
}

/// What the relay handed back on acceptance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub message_id: String,
}

/// Something that can deliver an [`OutgoingMail`].
///
/// Implementations must not retry on their own; the caller owns the retry
/// budget and the per-attempt deadline.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, mail: &OutgoingMail) -> Result<DeliveryReceipt, TransportError>;

    /// Check the relay is reachable.
    async fn health_check(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn name(&self) -> &'static str;
}

#[async_trait]
impl<T: MailTransport + ?Sized> MailTransport for Arc<T> {
    async fn send(&self, mail: &OutgoingMail) -> Result<DeliveryReceipt, TransportError> {
        (**self).send(mail).await
    }

    async fn health_check(&self) -> Result<(), TransportError> {
        (**self).health_check().await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}
