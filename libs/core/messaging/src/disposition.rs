//! Mapping processor outcomes onto broker acknowledgements.

use crate::config::RedeliveryPolicy;
use crate::error::{ErrorCategory, ProcessingError};
use crate::job::Job;
use crate::processor::Processor;
use std::time::Duration;
use tracing::{debug, warn};

/// What the worker should tell the broker about a delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Processing finished (successfully or with a handled failure): ack.
    Ack,

    /// Transient failure with deliveries left: nak and ask for a delayed redelivery.
    Redeliver { delay: Duration, error: String },

    /// Give up: record on the dead-letter stream, notify the processor, terminate.
    DeadLetter { reason: String },
}

impl Disposition {
    pub fn label(&self) -> &'static str {
        match self {
            Disposition::Ack => "ack",
            Disposition::Redeliver { .. } => "redeliver",
            Disposition::DeadLetter { .. } => "dead_letter",
        }
    }
}

/// Run the processor for one delivery and decide its disposition.
///
/// `delivery_count` is the broker's count for this message, starting at 1.
/// [`Processor::on_dead_letter`] is not called here; the caller invokes it
/// once the dead-letter entry is durably recorded.
pub async fn process_delivery<J, P>(
    processor: &P,
    job: &J,
    delivery_count: u32,
    policy: &RedeliveryPolicy,
) -> Disposition
where
    J: Job,
    P: Processor<J> + ?Sized,
{
    match processor.process(job).await {
        Ok(()) => Disposition::Ack,
        Err(error) => classify_failure(job, &error, delivery_count, policy),
    }
}

fn classify_failure<J: Job>(
    job: &J,
    error: &ProcessingError,
    delivery_count: u32,
    policy: &RedeliveryPolicy,
) -> Disposition {
    match error.category() {
        ErrorCategory::Permanent => {
            warn!(
                job_id = %job.job_id(),
                error = %error,
                "Permanent error, dead-lettering"
            );
            Disposition::DeadLetter {
                reason: error.to_string(),
            }
        }
        ErrorCategory::Transient if policy.is_exhausted(delivery_count) => {
            warn!(
                job_id = %job.job_id(),
                error = %error,
                delivery_count,
                max_deliver = policy.max_deliver,
                "Delivery limit reached, dead-lettering"
            );
            Disposition::DeadLetter {
                reason: format!(
                    "delivery limit reached after {delivery_count} attempts: {error}"
                ),
            }
        }
        ErrorCategory::Transient => {
            let delay = policy.redelivery_delay(delivery_count);
            debug!(
                job_id = %job.job_id(),
                error = %error,
                delivery_count,
                delay_ms = delay.as_millis() as u64,
                "Transient error, requesting redelivery"
            );
            Disposition::Redeliver {
                delay,
                error: error.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BackoffStrategy;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Serialize, Deserialize)]
    struct TestJob {
        id: String,
    }

    impl Job for TestJob {
        fn job_id(&self) -> String {
            self.id.clone()
        }
    }

    enum Outcome {
        Ok,
        Transient,
        Permanent,
    }

    struct ScriptedProcessor(Outcome);

    #[async_trait]
    impl Processor<TestJob> for ScriptedProcessor {
        async fn process(&self, _job: &TestJob) -> Result<(), ProcessingError> {
            match self.0 {
                Outcome::Ok => Ok(()),
                Outcome::Transient => Err(ProcessingError::transient("smtp timeout")),
                Outcome::Permanent => Err(ProcessingError::permanent("mailbox unknown")),
            }
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn job() -> TestJob {
        TestJob {
            id: "job-1".to_string(),
        }
    }

    fn policy() -> RedeliveryPolicy {
        RedeliveryPolicy::new(3).with_backoff(BackoffStrategy::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
        })
    }

    #[tokio::test]
    async fn test_success_acks() {
        let disposition =
            process_delivery(&ScriptedProcessor(Outcome::Ok), &job(), 1, &policy()).await;
        assert_eq!(disposition, Disposition::Ack);
    }

    #[tokio::test]
    async fn test_permanent_dead_letters_on_first_delivery() {
        let disposition =
            process_delivery(&ScriptedProcessor(Outcome::Permanent), &job(), 1, &policy()).await;

        match disposition {
            Disposition::DeadLetter { reason } => assert!(reason.contains("mailbox unknown")),
            other => panic!("expected dead letter, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transient_redelivers_with_growing_delay() {
        let processor = ScriptedProcessor(Outcome::Transient);

        let first = process_delivery(&processor, &job(), 1, &policy()).await;
        let second = process_delivery(&processor, &job(), 2, &policy()).await;

        assert_eq!(
            first,
            Disposition::Redeliver {
                delay: Duration::from_millis(100),
                error: "transient error: smtp timeout".to_string(),
            }
        );
        assert_eq!(second.label(), "redeliver");
        if let Disposition::Redeliver { delay, .. } = second {
            assert_eq!(delay, Duration::from_millis(200));
        }
    }

    #[tokio::test]
    async fn test_transient_dead_letters_at_delivery_limit() {
        let disposition =
            process_delivery(&ScriptedProcessor(Outcome::Transient), &job(), 3, &policy()).await;

        match disposition {
            Disposition::DeadLetter { reason } => {
                assert!(reason.starts_with("delivery limit reached after 3 attempts"));
            }
            other => panic!("expected dead letter, got {other:?}"),
        }
    }
}
