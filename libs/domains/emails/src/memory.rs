//! In-memory store for tests and local development

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{EmailError, EmailResult};
use crate::models::{EmailPage, EmailRecord, EmailStatus, SearchQuery, now_micros};
use crate::store::{EmailStore, check_transition};

#[derive(Clone, Default)]
pub struct InMemoryEmailStore {
    records: Arc<RwLock<HashMap<Uuid, EmailRecord>>>,
}

impl InMemoryEmailStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

fn matches_term(record: &EmailRecord, term: &str) -> bool {
    let term = term.to_lowercase();
    record.subject.to_lowercase().contains(&term)
        || record.body.to_lowercase().contains(&term)
        || record.to.iter().any(|r| r.to_lowercase().contains(&term))
}

#[async_trait]
impl EmailStore for InMemoryEmailStore {
    async fn upsert(&self, record: EmailRecord) -> EmailResult<EmailRecord> {
        let mut records = self.records.write().await;

        match records.get(&record.id) {
            Some(existing) if existing.same_payload(&record) => Ok(existing.clone()),
            Some(_) => Err(EmailError::ConstraintViolation(format!(
                "email {} already exists with a different payload",
                record.id
            ))),
            None => {
                records.insert(record.id, record.clone());
                Ok(record)
            }
        }
    }

    async fn get_by_id(&self, id: Uuid) -> EmailResult<EmailRecord> {
        self.records
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(EmailError::NotFound(id))
    }

    async fn search(&self, query: &SearchQuery) -> EmailResult<EmailPage> {
        let cursor = query.decoded_cursor()?;
        let limit = query.limit();

        let mut matching: Vec<EmailRecord> = {
            let records = self.records.read().await;
            records
                .values()
                .filter(|r| query.term().is_none_or(|term| matches_term(r, term)))
                .cloned()
                .collect()
        };
        let total_count = matching.len() as u64;

        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

        let rows = matching
            .into_iter()
            .filter(|r| cursor.is_none_or(|c| c.precedes(r)))
            .take(limit as usize + 1)
            .collect();

        Ok(EmailPage::from_rows(rows, limit, total_count))
    }

    async fn update_status(
        &self,
        id: Uuid,
        from: EmailStatus,
        to: EmailStatus,
    ) -> EmailResult<EmailRecord> {
        check_transition(from, to)?;

        let mut records = self.records.write().await;
        let record = records.get_mut(&id).ok_or(EmailError::NotFound(id))?;

        if record.status != from {
            return Err(EmailError::StaleState {
                id,
                expected: from,
                actual: record.status,
            });
        }

        record.status = to;
        record.updated_at = now_micros();
        Ok(record.clone())
    }

    async fn claim_stale(
        &self,
        status: EmailStatus,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> EmailResult<Vec<EmailRecord>> {
        let mut records = self.records.write().await;

        let mut stale: Vec<&mut EmailRecord> = records
            .values_mut()
            .filter(|r| r.status == status && r.updated_at < older_than)
            .collect();
        stale.sort_by_key(|r| r.updated_at);

        let now = now_micros();
        Ok(stale
            .into_iter()
            .take(limit as usize)
            .map(|r| {
                r.updated_at = now;
                r.clone()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CreateEmail;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn record(subject: &str) -> EmailRecord {
        EmailRecord::new(CreateEmail {
            from: "ops@example.com".to_string(),
            to: vec!["a@b.com".to_string()],
            subject: subject.to_string(),
            body: "body".to_string(),
        })
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = InMemoryEmailStore::new();
        let original = store.upsert(record("hi")).await.unwrap();
        store
            .update_status(original.id, EmailStatus::Pending, EmailStatus::Published)
            .await
            .unwrap();

        let again = store.upsert(original.clone()).await.unwrap();

        assert_eq!(again.status, EmailStatus::Published);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_upsert_conflicting_payload() {
        let store = InMemoryEmailStore::new();
        let original = store.upsert(record("hi")).await.unwrap();

        let mut changed = original.clone();
        changed.subject = "different".to_string();

        assert!(matches!(
            store.upsert(changed).await,
            Err(EmailError::ConstraintViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_update_status_errors() {
        let store = InMemoryEmailStore::new();
        let stored = store.upsert(record("hi")).await.unwrap();

        assert!(matches!(
            store
                .update_status(stored.id, EmailStatus::Pending, EmailStatus::Sent)
                .await,
            Err(EmailError::InvalidInput(_))
        ));
        let missing = Uuid::now_v7();
        assert_eq!(
            store
                .update_status(missing, EmailStatus::Pending, EmailStatus::Published)
                .await,
            Err(EmailError::NotFound(missing))
        );
        assert_eq!(
            store
                .update_status(stored.id, EmailStatus::Published, EmailStatus::Sent)
                .await,
            Err(EmailError::StaleState {
                id: stored.id,
                expected: EmailStatus::Published,
                actual: EmailStatus::Pending,
            })
        );
    }

    #[tokio::test]
    async fn test_update_status_refreshes_updated_at() {
        let store = InMemoryEmailStore::new();
        let stored = store.upsert(record("hi")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;

        let updated = store
            .update_status(stored.id, EmailStatus::Pending, EmailStatus::Published)
            .await
            .unwrap();

        assert!(updated.updated_at > stored.updated_at);
        assert_eq!(updated.created_at, stored.created_at);
    }

    #[tokio::test]
    async fn test_search_matches_subject_body_and_recipients() {
        let store = InMemoryEmailStore::new();
        store.upsert(record("Invoice March")).await.unwrap();
        let mut to_match = record("other");
        to_match.to = vec!["billing@corp.example".to_string()];
        store.upsert(to_match).await.unwrap();
        let mut body_match = record("another");
        body_match.body = "your INVOICE is attached".to_string();
        store.upsert(body_match).await.unwrap();
        store.upsert(record("unrelated")).await.unwrap();

        let invoices = store
            .search(&SearchQuery {
                search: Some("invoice".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(invoices.total_count, 2);

        let billing = store
            .search(&SearchQuery {
                search: Some("BILLING@".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(billing.emails.len(), 1);
    }

    #[tokio::test]
    async fn test_pages_concatenate_to_full_result() {
        let store = InMemoryEmailStore::new();
        let base = now_micros();
        for i in 0..23 {
            let mut r = record(&format!("report {i}"));
            // Several records share a timestamp to exercise the id tie-break.
            r.created_at = base - chrono::Duration::seconds(i / 3);
            store.upsert(r).await.unwrap();
        }

        let everything = store
            .search(&SearchQuery {
                limit: Some(100),
                ..Default::default()
            })
            .await
            .unwrap();

        let mut paged = Vec::new();
        let mut cursor = None;
        loop {
            let page = store
                .search(&SearchQuery {
                    search: None,
                    cursor: cursor.clone(),
                    limit: Some(5),
                })
                .await
                .unwrap();
            assert_eq!(page.total_count, 23);
            paged.extend(page.emails);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        let ids: HashSet<_> = paged.iter().map(|r| r.id).collect();
        assert_eq!(ids.len(), 23);
        assert_eq!(paged, everything.emails);
    }

    #[tokio::test]
    async fn test_claim_stale_refreshes_claimed() {
        let store = InMemoryEmailStore::new();
        let old = store.upsert(record("old")).await.unwrap();
        store
            .update_status(old.id, EmailStatus::Pending, EmailStatus::Published)
            .await
            .unwrap();
        store.upsert(record("pending")).await.unwrap();

        let cutoff = now_micros() + chrono::Duration::seconds(1);
        let claimed = store
            .claim_stale(EmailStatus::Published, cutoff, 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, old.id);

        let again = store
            .claim_stale(EmailStatus::Published, claimed[0].updated_at, 10)
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    fn status() -> impl Strategy<Value = EmailStatus> {
        prop_oneof![
            Just(EmailStatus::Pending),
            Just(EmailStatus::Published),
            Just(EmailStatus::Sent),
            Just(EmailStatus::Failed),
        ]
    }

    fn rank(status: EmailStatus) -> u8 {
        match status {
            EmailStatus::Pending => 0,
            EmailStatus::Published => 1,
            EmailStatus::Sent | EmailStatus::Failed => 2,
        }
    }

    proptest! {
        #[test]
        fn prop_status_never_regresses(
            ops in prop::collection::vec((status(), status()), 1..40)
        ) {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_all()
                .build()
                .unwrap();

            runtime.block_on(async {
                let store = InMemoryEmailStore::new();
                let id = store.upsert(record("prop")).await.unwrap().id;

                let observer = {
                    let store = store.clone();
                    let n = ops.len();
                    tokio::spawn(async move {
                        let mut seen = Vec::with_capacity(n);
                        for _ in 0..n {
                            seen.push(store.get_by_id(id).await.unwrap().status);
                            tokio::task::yield_now().await;
                        }
                        seen
                    })
                };

                let writers: Vec<_> = ops
                    .into_iter()
                    .map(|(from, to)| {
                        let store = store.clone();
                        tokio::spawn(async move { store.update_status(id, from, to).await })
                    })
                    .collect();

                let mut terminal_writes = 0;
                for writer in writers {
                    if let Ok(updated) = writer.await.unwrap() {
                        prop_assert!(rank(updated.status) > 0);
                        if updated.status.is_terminal() {
                            terminal_writes += 1;
                        }
                    }
                }
                prop_assert!(terminal_writes <= 1);

                let seen = observer.await.unwrap();
                for pair in seen.windows(2) {
                    prop_assert!(rank(pair[0]) <= rank(pair[1]));
                    if pair[0].is_terminal() {
                        prop_assert_eq!(pair[0], pair[1]);
                    }
                }
                Ok::<(), TestCaseError>(())
            })?;
        }
    }
}
