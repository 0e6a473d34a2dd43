//! Processor trait for job execution.

use crate::error::ProcessingError;
use crate::job::Job;
use async_trait::async_trait;

/// Job processor trait.
///
/// Implement this trait to define how jobs are processed. The processor
/// is backend-agnostic; the worker maps its result onto broker acks.
///
/// # Error Handling
///
/// Return a `ProcessingError` with the appropriate category:
/// - `Transient`: the message is redelivered with backoff until the delivery
///   limit, then dead-lettered
/// - `Permanent`: the message is dead-lettered immediately
///
/// Returning `Ok(())` acknowledges the message. Processors that handle a
/// permanent failure themselves (e.g. by recording it) should return `Ok(())`
/// so the message is not dead-lettered twice.
#[async_trait]
pub trait Processor<J: Job>: Send + Sync {
    /// Process a job.
    async fn process(&self, job: &J) -> Result<(), ProcessingError>;

    /// Get the processor name.
    ///
    /// Used for logging and metrics labels.
    fn name(&self) -> &'static str;

    /// Perform a health check.
    ///
    /// Override to check downstream service availability. Used by the
    /// worker's readiness probe.
    async fn health_check(&self) -> Result<bool, ProcessingError> {
        Ok(true)
    }

    /// Called once a job has been given up on and dead-lettered.
    ///
    /// Override to record the terminal failure in the domain.
    async fn on_dead_letter(&self, _job: &J, _reason: &str) {}
}
