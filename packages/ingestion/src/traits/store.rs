//! Storage traits for runs, job records and source settings.
//!
//! Every state transition is expressed as a guarded write that reports whether
//! it applied, so callers never read-modify-write shared state in memory.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::types::{
    CrawlOutcome, IngestionRun, InitializationSummary, JobCounts, JobKey, JobProgress, JobRecord,
    ListingEntry, RunGate, RunStatus, SourceSetting,
};

/// Run-level state.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a new run in `pending`.
    async fn create_run(&self, owner_id: Uuid) -> StoreResult<IngestionRun>;

    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<IngestionRun>>;

    /// Runs not yet terminal (`pending`, `initializing`, `ingesting`),
    /// oldest first.
    async fn unfinished_runs(&self) -> StoreResult<Vec<IngestionRun>>;

    /// Move a run to `to` if its current status is one of `from`.
    ///
    /// Entering `initializing` stamps `started_at`; entering a terminal status
    /// stamps `finished_at`. Returns whether the transition applied.
    async fn transition_run(
        &self,
        run_id: Uuid,
        from: &[RunStatus],
        to: RunStatus,
    ) -> StoreResult<bool>;

    /// Move a `pending`/`initializing` run to `error` with a message.
    async fn fail_run(&self, run_id: Uuid, message: &str) -> StoreResult<bool>;

    /// Record job totals once initialization has built the job set.
    async fn record_initialization(
        &self,
        run_id: Uuid,
        summary: InitializationSummary,
    ) -> StoreResult<()>;

    /// Run status plus the failure count for `source`, in one lookup.
    async fn run_gate(&self, run_id: Uuid, source: &str) -> StoreResult<Option<RunGate>>;

    /// Atomically add one to `metadata[source]`, returning the new count.
    async fn increment_source_failures(&self, run_id: Uuid, source: &str) -> StoreResult<i64>;

    /// Move an `ingesting` run to `finished` iff none of its jobs are pending.
    async fn try_finalize_run(&self, run_id: Uuid) -> StoreResult<bool>;
}

/// Per-document state.
#[async_trait]
pub trait JobRecordStore: Send + Sync {
    /// Insert or refresh a record for the current listing.
    ///
    /// Forces `status=pending`, sets `run_id`, copies listing metadata and
    /// clears `error_message`. Fingerprint and raw content ref are kept.
    async fn upsert_job(
        &self,
        run_id: Uuid,
        owner_id: Uuid,
        source: &str,
        entry: &ListingEntry,
    ) -> StoreResult<JobRecord>;

    /// Expire every record of owner+source whose external id is not in
    /// `current_ids`. Returns the number of records expired.
    async fn expire_missing(
        &self,
        run_id: Uuid,
        owner_id: Uuid,
        source: &str,
        current_ids: &[String],
    ) -> StoreResult<u64>;

    async fn get_job(&self, key: &JobKey) -> StoreResult<Option<JobRecord>>;

    /// Records of this run still waiting to be crawled.
    async fn pending_jobs(&self, run_id: Uuid) -> StoreResult<Vec<JobRecord>>;

    /// Progress rows for every record of the run, ordered by source then
    /// external id.
    async fn job_progress(&self, run_id: Uuid) -> StoreResult<Vec<JobProgress>>;

    async fn count_jobs(&self, run_id: Uuid) -> StoreResult<JobCounts>;

    /// Write a crawl outcome if the record is still pending for `run_id`.
    ///
    /// Returns false when the record was already resolved or now belongs to a
    /// different run, which makes redelivered items harmless.
    async fn complete_job(
        &self,
        key: &JobKey,
        run_id: Uuid,
        outcome: &CrawlOutcome,
    ) -> StoreResult<bool>;
}

/// Which sources each owner ingests from.
#[async_trait]
pub trait SourceSettingsStore: Send + Sync {
    /// Enabled sources for an owner, ordered by source name.
    async fn enabled_sources(&self, owner_id: Uuid) -> StoreResult<Vec<SourceSetting>>;

    /// All sources for an owner, ordered by source name.
    async fn list_sources(&self, owner_id: Uuid) -> StoreResult<Vec<SourceSetting>>;

    async fn upsert_source(&self, setting: &SourceSetting) -> StoreResult<SourceSetting>;

    async fn delete_source(&self, owner_id: Uuid, source: &str) -> StoreResult<bool>;
}

/// Everything the pipeline needs from durable storage.
pub trait IngestionStore: RunStore + JobRecordStore + SourceSettingsStore {}

impl<T> IngestionStore for T where T: RunStore + JobRecordStore + SourceSettingsStore {}
