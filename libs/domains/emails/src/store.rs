use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::EmailResult;
use crate::models::{EmailPage, EmailRecord, EmailStatus, SearchQuery};

/// Durable storage for email records.
///
/// Implementations must make `update_status` atomic with respect to the
/// status check: two callers racing on the same `from` status see exactly one
/// success.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmailStore: Send + Sync {
    /// Insert a record, or succeed without changes when an identical payload
    /// is already stored under the same id. Returns the stored record.
    ///
    /// A different payload under an existing id is a `ConstraintViolation`.
    async fn upsert(&self, record: EmailRecord) -> EmailResult<EmailRecord>;

    async fn get_by_id(&self, id: Uuid) -> EmailResult<EmailRecord>;

    /// One page ordered `created_at DESC, id ASC`.
    async fn search(&self, query: &SearchQuery) -> EmailResult<EmailPage>;

    /// Move `id` from `from` to `to`, refreshing `updated_at`.
    ///
    /// Fails with `InvalidInput` for an illegal transition, `NotFound` when
    /// absent and `StaleState` when the current status is not `from`.
    async fn update_status(
        &self,
        id: Uuid,
        from: EmailStatus,
        to: EmailStatus,
    ) -> EmailResult<EmailRecord>;

    /// Claim up to `limit` records in `status` last updated before
    /// `older_than`. Claimed records get a fresh `updated_at` so another
    /// sweeper will not pick them up again right away.
    async fn claim_stale(
        &self,
        status: EmailStatus,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> EmailResult<Vec<EmailRecord>>;
}

/// Reject illegal transitions before touching storage.
pub(crate) fn check_transition(from: EmailStatus, to: EmailStatus) -> EmailResult<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(crate::error::EmailError::InvalidInput(format!(
            "illegal status transition {from} -> {to}"
        )))
    }
}
