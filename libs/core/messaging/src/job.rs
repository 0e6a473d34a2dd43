//! Job trait for background job processing.

use serde::{de::DeserializeOwned, Serialize};

/// A job that can be processed by a worker.
///
/// Retry bookkeeping lives with the broker (delivery count), not in the
/// payload, so redelivered messages deserialize to identical jobs.
///
/// # Example
///
/// ```rust
/// use messaging::Job;
/// use serde::{Serialize, Deserialize};
///
/// #[derive(Clone, Serialize, Deserialize)]
/// struct ReportJob {
///     report_id: String,
/// }
///
/// impl Job for ReportJob {
///     fn job_id(&self) -> String {
///         self.report_id.clone()
///     }
/// }
/// ```
pub trait Job: Serialize + DeserializeOwned + Send + Sync + Clone + 'static {
    /// Get the unique job ID.
    ///
    /// This must be stable across redeliveries and re-publishes: it is used as
    /// the broker de-duplication key and as the idempotency key by processors.
    fn job_id(&self) -> String;

    /// Get the job type name (for logging and metrics).
    fn job_type(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}
