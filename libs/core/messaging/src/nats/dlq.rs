//! Dead letter stream for NATS.

use crate::nats::error::NatsError;
use crate::Job;
use async_nats::jetstream::stream::Config as StreamConfig;
use async_nats::jetstream::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Manager for dead letter stream operations.
///
/// Entries land on `<dlq>.failed` (jobs given up on) or `<dlq>.poison`
/// (payloads that never decoded), lowercase.
pub struct DlqManager {
    jetstream: Arc<Context>,
    dlq_stream: String,
    subject_prefix: String,
}

impl DlqManager {
    pub fn new(jetstream: Arc<Context>, dlq_stream: &str) -> Self {
        Self {
            jetstream,
            dlq_stream: dlq_stream.to_string(),
            subject_prefix: dlq_stream.to_lowercase(),
        }
    }

    /// Ensure the DLQ stream exists.
    pub async fn ensure_stream(&self) -> Result<(), NatsError> {
        self.jetstream
            .get_or_create_stream(StreamConfig {
                name: self.dlq_stream.clone(),
                subjects: vec![format!("{}.>", self.subject_prefix)],
                max_messages: 10_000,
                max_age: Duration::from_secs(30 * 24 * 60 * 60), // 30 days
                ..Default::default()
            })
            .await
            .map_err(NatsError::from_jetstream_error)?;

        debug!(stream = %self.dlq_stream, "DLQ stream ready");
        Ok(())
    }

    /// Record a job that was given up on.
    pub async fn move_to_dlq<J: Job>(
        &self,
        job: &J,
        reason: &str,
        original_sequence: u64,
        delivery_count: u32,
    ) -> Result<u64, NatsError> {
        let entry = DlqEntry {
            kind: DlqKind::Failed,
            job_id: Some(job.job_id()),
            job_type: Some(job.job_type().to_string()),
            job_data: serde_json::to_value(job)?,
            error: reason.to_string(),
            original_sequence,
            delivery_count,
            failed_at: Utc::now(),
        };

        self.publish(&entry).await
    }

    /// Record an undecodable payload for inspection.
    pub async fn record_poison(
        &self,
        payload: &[u8],
        error: &str,
        original_sequence: u64,
        delivery_count: u32,
    ) -> Result<u64, NatsError> {
        let entry = DlqEntry {
            kind: DlqKind::Poison,
            job_id: None,
            job_type: None,
            job_data: serde_json::Value::String(String::from_utf8_lossy(payload).into_owned()),
            error: error.to_string(),
            original_sequence,
            delivery_count,
            failed_at: Utc::now(),
        };

        self.publish(&entry).await
    }

    async fn publish(&self, entry: &DlqEntry) -> Result<u64, NatsError> {
        let payload = serde_json::to_vec(entry)?;
        let subject = format!("{}.{}", self.subject_prefix, entry.kind.as_str());

        let ack = self
            .jetstream
            .publish(subject, payload.into())
            .await?
            .await?;

        debug!(
            job_id = ?entry.job_id,
            kind = entry.kind.as_str(),
            sequence = ack.sequence,
            "Recorded DLQ entry"
        );

        Ok(ack.sequence)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqKind {
    Failed,
    Poison,
}

impl DlqKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DlqKind::Failed => "failed",
            DlqKind::Poison => "poison",
        }
    }
}

/// Entry stored on the dead letter stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub kind: DlqKind,
    pub job_id: Option<String>,
    pub job_type: Option<String>,
    /// Job as JSON, or the raw payload as a string for poison messages
    pub job_data: serde_json::Value,
    pub error: String,
    pub original_sequence: u64,
    pub delivery_count: u32,
    pub failed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dlq_entry_wire_format() {
        let entry = DlqEntry {
            kind: DlqKind::Poison,
            job_id: None,
            job_type: None,
            job_data: serde_json::Value::String("{not json".to_string()),
            error: "expected value at line 1 column 2".to_string(),
            original_sequence: 42,
            delivery_count: 1,
            failed_at: Utc::now(),
        };

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["kind"], "poison");
        assert_eq!(json["job_data"], "{not json");
        assert_eq!(json["original_sequence"], 42);
        assert!(json["job_id"].is_null());
    }
}
