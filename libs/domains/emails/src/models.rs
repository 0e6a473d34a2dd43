use chrono::{DateTime, SubsecRound, Utc};
use email::OutgoingMail;
use messaging::Job;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use uuid::Uuid;
use validator::{Validate, ValidateEmail, ValidationError};

use crate::error::{EmailError, EmailResult};

/// Delivery status of an email record.
///
/// Transitions only move forward: `Pending → Published → Sent | Failed`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EmailStatus {
    /// Persisted, creation event not yet acknowledged by the broker
    #[default]
    Pending,
    /// Creation event durably published
    Published,
    Sent,
    Failed,
}

impl EmailStatus {
    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: EmailStatus) -> bool {
        matches!(
            (self, next),
            (EmailStatus::Pending, EmailStatus::Published)
                | (EmailStatus::Published, EmailStatus::Sent)
                | (EmailStatus::Published, EmailStatus::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, EmailStatus::Sent | EmailStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EmailStatus::Pending => "pending",
            EmailStatus::Published => "published",
            EmailStatus::Sent => "sent",
            EmailStatus::Failed => "failed",
        }
    }
}

/// Current time truncated to microseconds, the precision Postgres keeps.
pub fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Email record as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailRecord {
    pub id: Uuid,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub status: EmailStatus,
    pub created_at: DateTime<Utc>,
    /// Time of the last status change
    pub updated_at: DateTime<Utc>,
}

impl EmailRecord {
    /// Build a fresh `Pending` record with a time-ordered id.
    pub fn new(input: CreateEmail) -> Self {
        let now = now_micros();
        Self {
            id: Uuid::now_v7(),
            from: input.from,
            to: input.to,
            subject: input.subject,
            body: input.body,
            status: EmailStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether both records carry the same message content.
    pub fn same_payload(&self, other: &EmailRecord) -> bool {
        self.from == other.from
            && self.to == other.to
            && self.subject == other.subject
            && self.body == other.body
    }

    /// The mail handed to the transport for this record.
    pub fn to_mail(&self) -> OutgoingMail {
        OutgoingMail::new(
            self.from.clone(),
            self.to.clone(),
            self.subject.clone(),
            self.body.clone(),
        )
        .with_reference(self.id.to_string())
    }
}

/// DTO for creating a new email
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CreateEmail {
    #[validate(email(message = "sender must be a valid email address"))]
    pub from: String,
    #[validate(custom(function = "validate_recipients"))]
    pub to: Vec<String>,
    #[validate(
        length(min = 1, max = 255, message = "subject must be 1-255 characters"),
        custom(function = "not_blank")
    )]
    pub subject: String,
    #[serde(default)]
    pub body: String,
}

#[allow(clippy::ptr_arg)]
fn validate_recipients(to: &Vec<String>) -> Result<(), ValidationError> {
    if to.is_empty() {
        return Err(ValidationError::new("recipients")
            .with_message("at least one recipient is required".into()));
    }
    if let Some(bad) = to.iter().find(|addr| !addr.validate_email()) {
        let mut err = ValidationError::new("recipients")
            .with_message(format!("'{bad}' is not a valid email address").into());
        err.add_param("value".into(), bad);
        return Err(err);
    }
    Ok(())
}

fn not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("blank").with_message("must not be blank".into()));
    }
    Ok(())
}

/// Event published once per created record.
///
/// Carries the whole message so the consumer can send without a lookup; the
/// record id doubles as the idempotency key and the broker message id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreationEvent {
    pub email_id: Uuid,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl From<&EmailRecord> for CreationEvent {
    fn from(record: &EmailRecord) -> Self {
        Self {
            email_id: record.id,
            from: record.from.clone(),
            to: record.to.clone(),
            subject: record.subject.clone(),
            body: record.body.clone(),
            created_at: record.created_at,
        }
    }
}

impl CreationEvent {
    pub fn to_mail(&self) -> OutgoingMail {
        OutgoingMail::new(
            self.from.clone(),
            self.to.clone(),
            self.subject.clone(),
            self.body.clone(),
        )
        .with_reference(self.email_id.to_string())
    }
}

impl Job for CreationEvent {
    fn job_id(&self) -> String {
        self.email_id.to_string()
    }

    fn job_type(&self) -> &'static str {
        "email.created"
    }
}

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Query parameters for searching emails
#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct SearchQuery {
    /// Case-insensitive substring matched against subject, body and recipients
    pub search: Option<String>,
    /// Opaque cursor from a previous page
    pub cursor: Option<String>,
    #[validate(range(min = 1, max = 100, message = "limit must be between 1 and 100"))]
    pub limit: Option<u32>,
}

impl SearchQuery {
    pub fn limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }

    /// Trimmed search term, `None` when absent or blank.
    pub fn term(&self) -> Option<&str> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn decoded_cursor(&self) -> EmailResult<Option<PageCursor>> {
        self.cursor
            .as_deref()
            .filter(|c| !c.is_empty())
            .map(PageCursor::decode)
            .transpose()
    }
}

/// Keyset position: the `(created_at, id)` of the last row of a page.
///
/// Pages are ordered `created_at DESC, id ASC`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

impl PageCursor {
    pub fn after(record: &EmailRecord) -> Self {
        Self {
            created_at: record.created_at,
            id: record.id,
        }
    }

    pub fn encode(&self) -> String {
        format!("{}_{}", self.created_at.timestamp_micros(), self.id.simple())
    }

    pub fn decode(raw: &str) -> EmailResult<Self> {
        let invalid = || EmailError::InvalidInput(format!("invalid cursor '{raw}'"));

        let (micros, id) = raw.split_once('_').ok_or_else(invalid)?;
        let micros: i64 = micros.parse().map_err(|_| invalid())?;
        let created_at = DateTime::from_timestamp_micros(micros).ok_or_else(invalid)?;
        let id = Uuid::parse_str(id).map_err(|_| invalid())?;

        Ok(Self { created_at, id })
    }

    /// Whether `record` sorts strictly after this cursor.
    pub fn precedes(&self, record: &EmailRecord) -> bool {
        record.created_at < self.created_at
            || (record.created_at == self.created_at && record.id > self.id)
    }
}

/// One page of search results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailPage {
    pub emails: Vec<EmailRecord>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
    /// Matches for the query, ignoring the cursor
    pub total_count: u64,
}

impl EmailPage {
    /// Build a page from up to `limit + 1` ordered rows.
    pub fn from_rows(mut rows: Vec<EmailRecord>, limit: u32, total_count: u64) -> Self {
        let has_more = rows.len() > limit as usize;
        rows.truncate(limit as usize);

        let next_cursor = if has_more {
            rows.last().map(|r| PageCursor::after(r).encode())
        } else {
            None
        };

        Self {
            emails: rows,
            next_cursor,
            has_more,
            total_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    fn input() -> CreateEmail {
        CreateEmail {
            from: "ops@example.com".to_string(),
            to: vec!["a@b.com".to_string()],
            subject: "hi".to_string(),
            body: "hello there".to_string(),
        }
    }

    #[test]
    fn test_only_forward_transitions_are_legal() {
        let legal: Vec<_> = EmailStatus::iter()
            .flat_map(|from| EmailStatus::iter().map(move |to| (from, to)))
            .filter(|(from, to)| from.can_transition_to(*to))
            .collect();

        assert_eq!(
            legal,
            vec![
                (EmailStatus::Pending, EmailStatus::Published),
                (EmailStatus::Published, EmailStatus::Sent),
                (EmailStatus::Published, EmailStatus::Failed),
            ]
        );
    }

    #[test]
    fn test_status_string_forms_agree() {
        for status in EmailStatus::iter() {
            assert_eq!(status.to_string(), status.as_str());
            assert_eq!(EmailStatus::from_str(status.as_str()).unwrap(), status);
            assert_eq!(
                serde_json::to_string(&status).unwrap(),
                format!("\"{}\"", status.as_str())
            );
        }
    }

    #[test]
    fn test_new_record_is_pending_with_equal_timestamps() {
        let record = EmailRecord::new(input());

        assert_eq!(record.status, EmailStatus::Pending);
        assert_eq!(record.created_at, record.updated_at);
        assert_eq!(record.created_at.timestamp_subsec_nanos() % 1_000, 0);
    }

    #[test]
    fn test_create_email_validation() {
        assert!(input().validate().is_ok());

        let mut no_recipients = input();
        no_recipients.to.clear();
        assert!(no_recipients.validate().is_err());

        let mut bad_recipient = input();
        bad_recipient.to.push("not-an-address".to_string());
        assert!(bad_recipient.validate().is_err());

        let mut bad_sender = input();
        bad_sender.from = "ops".to_string();
        assert!(bad_sender.validate().is_err());

        let mut blank_subject = input();
        blank_subject.subject = "   ".to_string();
        assert!(blank_subject.validate().is_err());

        let mut long_subject = input();
        long_subject.subject = "x".repeat(256);
        assert!(long_subject.validate().is_err());
    }

    #[test]
    fn test_cursor_encoding() {
        let record = EmailRecord::new(input());
        let cursor = PageCursor::after(&record);

        assert_eq!(PageCursor::decode(&cursor.encode()).unwrap(), cursor);
        assert!(matches!(
            PageCursor::decode("yesterday"),
            Err(EmailError::InvalidInput(_))
        ));
        assert!(matches!(
            PageCursor::decode("123_not-a-uuid"),
            Err(EmailError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_cursor_ordering() {
        let base = EmailRecord::new(input());
        let cursor = PageCursor::after(&base);

        let mut older = base.clone();
        older.created_at -= chrono::Duration::seconds(1);
        older.id = Uuid::nil();
        assert!(cursor.precedes(&older));

        let mut same_time_higher_id = base.clone();
        same_time_higher_id.id = Uuid::from_u128(u128::MAX);
        assert!(cursor.precedes(&same_time_higher_id));

        assert!(!cursor.precedes(&base));

        let mut newer = base.clone();
        newer.created_at += chrono::Duration::seconds(1);
        assert!(!cursor.precedes(&newer));
    }

    #[test]
    fn test_page_from_rows() {
        let rows: Vec<_> = (0..3).map(|_| EmailRecord::new(input())).collect();

        let page = EmailPage::from_rows(rows.clone(), 2, 3);
        assert_eq!(page.emails.len(), 2);
        assert!(page.has_more);
        assert_eq!(
            page.next_cursor,
            Some(PageCursor::after(&rows[1]).encode())
        );

        let last = EmailPage::from_rows(rows, 3, 3);
        assert!(!last.has_more);
        assert!(last.next_cursor.is_none());
    }

    #[test]
    fn test_search_query_defaults() {
        let query = SearchQuery {
            search: Some("  ".to_string()),
            ..Default::default()
        };
        assert_eq!(query.limit(), DEFAULT_PAGE_SIZE);
        assert_eq!(query.term(), None);
        assert!(query.decoded_cursor().unwrap().is_none());

        let too_big = SearchQuery {
            limit: Some(101),
            ..Default::default()
        };
        assert!(too_big.validate().is_err());
    }

    #[test]
    fn test_event_carries_record() {
        let record = EmailRecord::new(input());
        let event = CreationEvent::from(&record);

        assert_eq!(event.job_id(), record.id.to_string());
        assert_eq!(event.to_mail(), record.to_mail());
        assert_eq!(event.to_mail().reference, Some(record.id.to_string()));
    }
}
