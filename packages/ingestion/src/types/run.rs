//! Ingestion run model and point-in-time status reports.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::JobStatus;

// ============================================================================
// Enums
// ============================================================================

/// Run-level state machine.
///
/// `pending -> initializing -> ingesting -> finished`, with `error` reachable
/// from `pending`/`initializing` and `aborted` from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(
    feature = "postgres",
    sqlx(type_name = "ingestion_run_status", rename_all = "snake_case")
)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Initializing,
    Ingesting,
    Finished,
    Error,
    Aborted,
}

impl RunStatus {
    /// Terminal runs are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Finished | RunStatus::Error | RunStatus::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Initializing => "initializing",
            RunStatus::Ingesting => "ingesting",
            RunStatus::Finished => "finished",
            RunStatus::Error => "error",
            RunStatus::Aborted => "aborted",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Run Model
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionRun {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub status: RunStatus,
    pub error_message: Option<String>,
    /// Source name -> crawl failure count for this run
    pub metadata: HashMap<String, i64>,
    pub total_jobs: i64,
    pub jobs_expired: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl IngestionRun {
    /// A freshly requested run in `pending`.
    pub fn new(owner_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            owner_id,
            status: RunStatus::Pending,
            error_message: None,
            metadata: HashMap::new(),
            total_jobs: 0,
            jobs_expired: 0,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    pub fn failure_count(&self, source: &str) -> i64 {
        self.metadata.get(source).copied().unwrap_or(0)
    }
}

/// What a crawl worker needs to know about its run, read in one lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunGate {
    pub status: RunStatus,
    pub source_failures: i64,
}

/// Bookkeeping written once initialization has built the job set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializationSummary {
    pub total_jobs: i64,
    pub jobs_expired: i64,
}

// ============================================================================
// Status Reports
// ============================================================================

/// Per-status job counts for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub total: i64,
    pub pending: i64,
    pub ready: i64,
    pub skipped: i64,
    pub error: i64,
    pub expired: i64,
}

impl JobCounts {
    pub fn add(&mut self, status: JobStatus, count: i64) {
        self.total += count;
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Ready => self.ready += count,
            JobStatus::Skipped => self.skipped += count,
            JobStatus::Error => self.error += count,
            JobStatus::Expired => self.expired += count,
        }
    }
}

/// Point-in-time view returned by `get_run_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatusReport {
    pub run_id: Uuid,
    pub owner_id: Uuid,
    pub status: RunStatus,
    pub error_message: Option<String>,
    pub counts: JobCounts,
    pub total_jobs: i64,
    pub jobs_expired: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunStatusReport {
    pub fn new(run: &IngestionRun, counts: JobCounts) -> Self {
        Self {
            run_id: run.id,
            owner_id: run.owner_id,
            status: run.status,
            error_message: run.error_message.clone(),
            counts,
            total_jobs: run.total_jobs,
            jobs_expired: run.jobs_expired,
            created_at: run.created_at,
            started_at: run.started_at,
            finished_at: run.finished_at,
        }
    }
}
