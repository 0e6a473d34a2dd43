use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{DatabaseConnection, DbBackend, FromQueryResult, Statement, Value};
use std::str::FromStr;
use uuid::Uuid;

use crate::{
    error::{EmailError, EmailResult},
    models::{EmailPage, EmailRecord, EmailStatus, SearchQuery, now_micros},
    store::{EmailStore, check_transition},
};

const COLUMNS: &str = "id, sender, recipients, subject, body, status, created_at, updated_at";

/// PostgreSQL implementation of [`EmailStore`]
#[derive(Clone)]
pub struct PgEmailStore {
    db: DatabaseConnection,
}

impl PgEmailStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    async fn fetch_one(&self, stmt: Statement) -> EmailResult<Option<EmailRecord>> {
        EmailRow::find_by_statement(stmt)
            .one(&self.db)
            .await?
            .map(EmailRecord::try_from)
            .transpose()
    }

    async fn fetch_all(&self, stmt: Statement) -> EmailResult<Vec<EmailRecord>> {
        EmailRow::find_by_statement(stmt)
            .all(&self.db)
            .await?
            .into_iter()
            .map(EmailRecord::try_from)
            .collect()
    }
}

#[derive(Debug, FromQueryResult)]
struct EmailRow {
    id: Uuid,
    sender: String,
    recipients: serde_json::Value,
    subject: String,
    body: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, FromQueryResult)]
struct CountRow {
    count: i64,
}

impl TryFrom<EmailRow> for EmailRecord {
    type Error = EmailError;

    fn try_from(row: EmailRow) -> Result<Self, Self::Error> {
        let to: Vec<String> = serde_json::from_value(row.recipients).map_err(|e| {
            EmailError::StoreRejected(format!("email {}: bad recipients: {}", row.id, e))
        })?;
        let status = EmailStatus::from_str(&row.status).map_err(|_| {
            EmailError::StoreRejected(format!(
                "email {}: unknown status '{}'",
                row.id, row.status
            ))
        })?;

        Ok(Self {
            id: row.id,
            from: row.sender,
            to,
            subject: row.subject,
            body: row.body,
            status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Escape LIKE wildcards so the term is matched literally.
fn like_pattern(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

/// `WHERE` fragment for the search term, numbering parameters from `values.len() + 1`.
fn push_term_filter(term: Option<&str>, conditions: &mut Vec<String>, values: &mut Vec<Value>) {
    if let Some(term) = term {
        values.push(like_pattern(term).into());
        let p = values.len();
        conditions.push(format!(
            "(subject ILIKE ${p} ESCAPE '\\' OR body ILIKE ${p} ESCAPE '\\' \
             OR EXISTS (SELECT 1 FROM jsonb_array_elements_text(recipients) AS r(addr) \
             WHERE r.addr ILIKE ${p} ESCAPE '\\'))"
        ));
    }
}

fn where_clause(conditions: &[String]) -> String {
    if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    }
}

#[async_trait]
impl EmailStore for PgEmailStore {
    async fn upsert(&self, record: EmailRecord) -> EmailResult<EmailRecord> {
        let recipients = serde_json::to_value(&record.to)
            .map_err(|e| EmailError::InvalidInput(format!("recipients: {}", e)))?;

        let sql = format!(
            r#"
            INSERT INTO emails ({COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            RETURNING {COLUMNS}
            "#
        );

        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            sql,
            [
                record.id.into(),
                record.from.clone().into(),
                recipients.into(),
                record.subject.clone().into(),
                record.body.clone().into(),
                record.status.as_str().into(),
                record.created_at.into(),
                record.updated_at.into(),
            ],
        );

        if let Some(inserted) = self.fetch_one(stmt).await? {
            tracing::debug!(email_id = %inserted.id, "Inserted email");
            return Ok(inserted);
        }

        let existing = self.get_by_id(record.id).await?;
        if existing.same_payload(&record) {
            tracing::debug!(email_id = %record.id, status = %existing.status, "Upsert matched stored email");
            Ok(existing)
        } else {
            Err(EmailError::ConstraintViolation(format!(
                "email {} already exists with a different payload",
                record.id
            )))
        }
    }

    async fn get_by_id(&self, id: Uuid) -> EmailResult<EmailRecord> {
        let sql = format!("SELECT {COLUMNS} FROM emails WHERE id = $1");
        let stmt = Statement::from_sql_and_values(DbBackend::Postgres, sql, [id.into()]);

        self.fetch_one(stmt).await?.ok_or(EmailError::NotFound(id))
    }

    async fn search(&self, query: &SearchQuery) -> EmailResult<EmailPage> {
        let cursor = query.decoded_cursor()?;
        let limit = query.limit();

        let mut conditions = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        push_term_filter(query.term(), &mut conditions, &mut values);

        let count_stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            format!(
                "SELECT COUNT(*) AS count FROM emails {}",
                where_clause(&conditions)
            ),
            values.clone(),
        );

        if let Some(cursor) = cursor {
            values.push(cursor.created_at.into());
            let ts = values.len();
            values.push(cursor.id.into());
            let id = values.len();
            conditions.push(format!(
                "(created_at < ${ts} OR (created_at = ${ts} AND id > ${id}))"
            ));
        }

        values.push(i64::from(limit + 1).into());
        let sql = format!(
            "SELECT {COLUMNS} FROM emails {} ORDER BY created_at DESC, id ASC LIMIT ${}",
            where_clause(&conditions),
            values.len()
        );
        let page_stmt = Statement::from_sql_and_values(DbBackend::Postgres, sql, values);

        let total_count = CountRow::find_by_statement(count_stmt)
            .one(&self.db)
            .await?
            .map(|row| row.count.max(0) as u64)
            .unwrap_or(0);
        let rows = self.fetch_all(page_stmt).await?;

        Ok(EmailPage::from_rows(rows, limit, total_count))
    }

    async fn update_status(
        &self,
        id: Uuid,
        from: EmailStatus,
        to: EmailStatus,
    ) -> EmailResult<EmailRecord> {
        check_transition(from, to)?;

        let sql = format!(
            r#"
            UPDATE emails
            SET status = $3, updated_at = $4
            WHERE id = $1 AND status = $2
            RETURNING {COLUMNS}
            "#
        );
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            sql,
            [
                id.into(),
                from.as_str().into(),
                to.as_str().into(),
                now_micros().into(),
            ],
        );

        if let Some(updated) = self.fetch_one(stmt).await? {
            tracing::info!(email_id = %id, from = %from, to = %to, "Updated email status");
            return Ok(updated);
        }

        // Nothing matched: tell a missing record from a status mismatch.
        let current = self.get_by_id(id).await?;
        Err(EmailError::StaleState {
            id,
            expected: from,
            actual: current.status,
        })
    }

    async fn claim_stale(
        &self,
        status: EmailStatus,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> EmailResult<Vec<EmailRecord>> {
        let sql = format!(
            r#"
            UPDATE emails
            SET updated_at = $3
            WHERE id IN (
                SELECT id FROM emails
                WHERE status = $1 AND updated_at < $2
                ORDER BY updated_at ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {COLUMNS}
            "#
        );
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            sql,
            [
                status.as_str().into(),
                older_than.into(),
                now_micros().into(),
                i64::from(limit).into(),
            ],
        );

        self.fetch_all(stmt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("50%_off"), "%50\\%\\_off%");
        assert_eq!(like_pattern("a\\b"), "%a\\\\b%");
    }

    #[test]
    fn test_term_filter_numbers_parameters() {
        let mut conditions = Vec::new();
        let mut values: Vec<Value> = vec![1i64.into()];

        push_term_filter(Some("invoice"), &mut conditions, &mut values);

        assert_eq!(values.len(), 2);
        assert!(conditions[0].contains("subject ILIKE $2"));
        assert!(conditions[0].contains("r.addr ILIKE $2"));
        // Addresses are matched one by one, never the JSON text of the array.
        assert!(!conditions[0].contains("recipients::text"));

        push_term_filter(None, &mut conditions, &mut values);
        assert_eq!(conditions.len(), 1);
    }

    #[test]
    fn test_where_clause() {
        assert_eq!(where_clause(&[]), "");
        assert_eq!(
            where_clause(&["a = $1".to_string(), "b = $2".to_string()]),
            "WHERE a = $1 AND b = $2"
        );
    }
}
