//! Per-document job records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fingerprint::Fingerprint;

/// Longest error message stored on a run or job record.
pub const MAX_ERROR_MESSAGE_LEN: usize = 500;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(
    feature = "postgres",
    sqlx(type_name = "job_record_status", rename_all = "snake_case")
)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    /// Content fetched and persisted in this run
    Ready,
    /// Content fetched but unchanged since the stored fingerprint
    Skipped,
    Error,
    /// No longer present in the source listing
    Expired,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Ready => "ready",
            JobStatus::Skipped => "skipped",
            JobStatus::Error => "error",
            JobStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Keys and Listings
// ============================================================================

/// Natural key of a job record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub owner_id: Uuid,
    pub source: String,
    pub external_id: String,
}

impl JobKey {
    pub fn new(owner_id: Uuid, source: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            owner_id,
            source: source.into(),
            external_id: external_id.into(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source, self.external_id)
    }
}

/// One posting as reported by a source's current listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingEntry {
    pub external_id: String,
    pub title: String,
    #[serde(default)]
    pub location: Option<String>,
    pub url: String,
}

impl ListingEntry {
    pub fn new(
        external_id: impl Into<String>,
        title: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            external_id: external_id.into(),
            title: title.into(),
            location: None,
            url: url.into(),
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

// ============================================================================
// Job Record Model
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub source: String,
    pub external_id: String,
    /// Run that last touched this record
    pub run_id: Uuid,
    pub url: String,
    pub title: String,
    pub location: Option<String>,
    pub status: JobStatus,
    pub fingerprint: Option<Fingerprint>,
    pub raw_content_ref: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn key(&self) -> JobKey {
        JobKey::new(self.owner_id, self.source.clone(), self.external_id.clone())
    }
}

/// Result of one crawl worker invocation, written back to the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlOutcome {
    /// New or changed content was persisted
    Ready {
        fingerprint: Fingerprint,
        raw_content_ref: String,
    },
    /// Content matched the stored fingerprint
    Skipped,
    /// Fetch, persist or circuit failure
    Failed { message: String },
}

impl CrawlOutcome {
    pub fn failed(message: impl Into<String>) -> Self {
        CrawlOutcome::Failed {
            message: truncate_message(&message.into()),
        }
    }

    pub fn status(&self) -> JobStatus {
        match self {
            CrawlOutcome::Ready { .. } => JobStatus::Ready,
            CrawlOutcome::Skipped => JobStatus::Skipped,
            CrawlOutcome::Failed { .. } => JobStatus::Error,
        }
    }
}

/// Compact per-job row used by progress snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub source: String,
    pub external_id: String,
    pub title: String,
    pub status: JobStatus,
}

impl From<&JobRecord> for JobProgress {
    fn from(record: &JobRecord) -> Self {
        Self {
            source: record.source.clone(),
            external_id: record.external_id.clone(),
            title: record.title.clone(),
            status: record.status,
        }
    }
}

/// Cap an error message at [`MAX_ERROR_MESSAGE_LEN`] characters.
pub fn truncate_message(message: &str) -> String {
    message.chars().take(MAX_ERROR_MESSAGE_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_status() {
        let ready = CrawlOutcome::Ready {
            fingerprint: Fingerprint::from_bits(1),
            raw_content_ref: "raw/x".to_string(),
        };
        assert_eq!(ready.status(), JobStatus::Ready);
        assert_eq!(CrawlOutcome::Skipped.status(), JobStatus::Skipped);
        assert_eq!(CrawlOutcome::failed("boom").status(), JobStatus::Error);
    }

    #[test]
    fn test_failed_message_is_truncated() {
        let long = "x".repeat(MAX_ERROR_MESSAGE_LEN + 50);
        match CrawlOutcome::failed(long) {
            CrawlOutcome::Failed { message } => assert_eq!(message.len(), MAX_ERROR_MESSAGE_LEN),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_listing_entry_deserializes_without_location() {
        let entry: ListingEntry = serde_json::from_str(
            r#"{"external_id": "J1", "title": "Engineer", "url": "https://acme.test/J1"}"#,
        )
        .unwrap();
        assert_eq!(entry.external_id, "J1");
        assert!(entry.location.is_none());
    }

    #[test]
    fn test_job_key_display() {
        let key = JobKey::new(Uuid::nil(), "acme", "J1");
        assert_eq!(key.to_string(), "acme/J1");
    }
}
