//! Send pipeline: bounded in-process retries around a mail transport.

use email::{DeliveryReceipt, MailTransport, OutgoingMail};
use messaging::BackoffStrategy;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{EmailError, EmailResult};
use crate::metrics;

/// Retry budget for a single send.
#[derive(Debug, Clone)]
pub struct SendPolicy {
    /// Attempts including the first, at least 1
    pub max_attempts: u32,
    /// Hard deadline per transport call
    pub attempt_timeout: Duration,
    pub backoff: BackoffStrategy,
}

impl Default for SendPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(10),
            backoff: BackoffStrategy::Exponential {
                base: Duration::from_millis(200),
                max: Duration::from_secs(5),
            },
        }
    }
}

impl SendPolicy {
    pub fn new(max_attempts: u32, attempt_timeout: Duration, backoff_base: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            attempt_timeout,
            backoff: BackoffStrategy::Exponential {
                base: backoff_base,
                max: backoff_base.saturating_mul(16),
            },
        }
    }

    /// Longest one `send` can run: every attempt hitting its deadline plus
    /// the backoff between attempts.
    pub fn worst_case(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        let backoff: Duration = (0..attempts - 1).map(|i| self.backoff.delay(i)).sum();
        self.attempt_timeout.saturating_mul(attempts) + backoff
    }
}

/// Sends mail through `T`, classifying every failure as `Transient`,
/// `Permanent` or `Canceled`.
pub struct SendPipeline<T: MailTransport> {
    transport: Arc<T>,
    policy: SendPolicy,
}

impl<T: MailTransport> Clone for SendPipeline<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            policy: self.policy.clone(),
        }
    }
}

impl<T: MailTransport> SendPipeline<T> {
    pub fn new(transport: T, policy: SendPolicy) -> Self {
        Self::from_arc(Arc::new(transport), policy)
    }

    pub fn from_arc(transport: Arc<T>, policy: SendPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> &SendPolicy {
        &self.policy
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Send `mail`, retrying transient failures up to the policy's budget.
    ///
    /// Cancellation is observed during an attempt and during backoff; the
    /// in-flight transport call is dropped and `Canceled` returned.
    pub async fn send(
        &self,
        mail: &OutgoingMail,
        cancel: &CancellationToken,
    ) -> EmailResult<DeliveryReceipt> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(EmailError::Canceled);
            }

            let start = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    metrics::send_attempt("canceled", start.elapsed());
                    return Err(EmailError::Canceled);
                }
                outcome = tokio::time::timeout(self.policy.attempt_timeout, self.transport.send(mail)) => outcome,
            };

            let error = match outcome {
                Ok(Ok(receipt)) => {
                    metrics::send_attempt("ok", start.elapsed());
                    debug!(
                        attempt,
                        transport = self.transport.name(),
                        message_id = %receipt.message_id,
                        "Mail accepted"
                    );
                    return Ok(receipt);
                }
                Ok(Err(e)) if !e.is_retryable() => {
                    metrics::send_attempt("permanent", start.elapsed());
                    warn!(attempt, error = %e, "Mail rejected permanently");
                    return Err(EmailError::Permanent(e.to_string()));
                }
                Ok(Err(e)) => {
                    metrics::send_attempt("transient", start.elapsed());
                    EmailError::Transient(e.to_string())
                }
                Err(_) => {
                    metrics::send_attempt("timeout", start.elapsed());
                    EmailError::Transient(format!(
                        "attempt timed out after {}ms",
                        self.policy.attempt_timeout.as_millis()
                    ))
                }
            };

            if attempt >= max_attempts {
                warn!(attempts = attempt, error = %error, "Send attempts exhausted");
                return Err(error);
            }

            let delay = self.policy.backoff.delay(attempt - 1);
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Send failed, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EmailError::Canceled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}
