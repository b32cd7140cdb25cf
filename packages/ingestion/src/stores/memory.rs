//! In-memory storage implementation for testing and development.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::traits::store::{JobRecordStore, RunStore, SourceSettingsStore};
use crate::types::{
    truncate_message, CrawlOutcome, IngestionRun, InitializationSummary, JobCounts, JobKey,
    JobProgress, JobRecord, JobStatus, ListingEntry, RunGate, RunStatus, SourceSetting,
};

#[derive(Default)]
struct Inner {
    runs: HashMap<Uuid, IngestionRun>,
    jobs: HashMap<JobKey, JobRecord>,
    settings: BTreeMap<(Uuid, String), SourceSetting>,
}

/// In-memory storage for runs, job records and source settings.
///
/// All operations take a single lock, so every guarded write is atomic.
/// Data is lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_job_writes: AtomicBool,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make job record writes fail as if the database were unreachable.
    pub fn set_fail_job_writes(&self, fail: bool) {
        self.fail_job_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of job records across all owners.
    pub async fn job_count(&self) -> usize {
        self.inner.lock().await.jobs.len()
    }

    /// Number of runs across all owners.
    pub async fn run_count(&self) -> usize {
        self.inner.lock().await.runs.len()
    }

    fn check_job_writes(&self) -> StoreResult<()> {
        if self.fail_job_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "job record writes are disabled".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn create_run(&self, owner_id: Uuid) -> StoreResult<IngestionRun> {
        let run = IngestionRun::new(owner_id);
        self.inner.lock().await.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<IngestionRun>> {
        Ok(self.inner.lock().await.runs.get(&run_id).cloned())
    }

    async fn unfinished_runs(&self) -> StoreResult<Vec<IngestionRun>> {
        let inner = self.inner.lock().await;
        let mut runs: Vec<IngestionRun> = inner
            .runs
            .values()
            .filter(|run| !run.status.is_terminal())
            .cloned()
            .collect();
        runs.sort_by_key(|run| (run.created_at, run.id));
        Ok(runs)
    }

    async fn transition_run(
        &self,
        run_id: Uuid,
        from: &[RunStatus],
        to: RunStatus,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let Some(run) = inner.runs.get_mut(&run_id) else {
            return Ok(false);
        };
        if !from.contains(&run.status) {
            return Ok(false);
        }

        let now = Utc::now();
        run.status = to;
        run.updated_at = now;
        if to == RunStatus::Initializing && run.started_at.is_none() {
            run.started_at = Some(now);
        }
        if to.is_terminal() {
            run.finished_at = Some(now);
        }
        Ok(true)
    }

    async fn fail_run(&self, run_id: Uuid, message: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let Some(run) = inner.runs.get_mut(&run_id) else {
            return Ok(false);
        };
        if !matches!(run.status, RunStatus::Pending | RunStatus::Initializing) {
            return Ok(false);
        }

        let now = Utc::now();
        run.status = RunStatus::Error;
        run.error_message = Some(truncate_message(message));
        run.finished_at = Some(now);
        run.updated_at = now;
        Ok(true)
    }

    async fn record_initialization(
        &self,
        run_id: Uuid,
        summary: InitializationSummary,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;
        run.total_jobs = summary.total_jobs;
        run.jobs_expired = summary.jobs_expired;
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn run_gate(&self, run_id: Uuid, source: &str) -> StoreResult<Option<RunGate>> {
        Ok(self.inner.lock().await.runs.get(&run_id).map(|run| RunGate {
            status: run.status,
            source_failures: run.failure_count(source),
        }))
    }

    async fn increment_source_failures(&self, run_id: Uuid, source: &str) -> StoreResult<i64> {
        let mut inner = self.inner.lock().await;
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;
        let count = run.metadata.entry(source.to_string()).or_insert(0);
        *count += 1;
        let count = *count;
        run.updated_at = Utc::now();
        Ok(count)
    }

    async fn try_finalize_run(&self, run_id: Uuid) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let any_pending = inner
            .jobs
            .values()
            .any(|job| job.run_id == run_id && job.status == JobStatus::Pending);
        if any_pending {
            return Ok(false);
        }

        let Some(run) = inner.runs.get_mut(&run_id) else {
            return Ok(false);
        };
        if run.status != RunStatus::Ingesting {
            return Ok(false);
        }

        let now = Utc::now();
        run.status = RunStatus::Finished;
        run.finished_at = Some(now);
        run.updated_at = now;
        Ok(true)
    }
}

#[async_trait]
impl JobRecordStore for MemoryStore {
    async fn upsert_job(
        &self,
        run_id: Uuid,
        owner_id: Uuid,
        source: &str,
        entry: &ListingEntry,
    ) -> StoreResult<JobRecord> {
        self.check_job_writes()?;

        let key = JobKey::new(owner_id, source, entry.external_id.clone());
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let record = inner
            .jobs
            .entry(key)
            .and_modify(|job| {
                job.run_id = run_id;
                job.url = entry.url.clone();
                job.title = entry.title.clone();
                job.location = entry.location.clone();
                job.status = JobStatus::Pending;
                job.error_message = None;
                job.updated_at = now;
            })
            .or_insert_with(|| JobRecord {
                id: Uuid::now_v7(),
                owner_id,
                source: source.to_string(),
                external_id: entry.external_id.clone(),
                run_id,
                url: entry.url.clone(),
                title: entry.title.clone(),
                location: entry.location.clone(),
                status: JobStatus::Pending,
                fingerprint: None,
                raw_content_ref: None,
                error_message: None,
                created_at: now,
                updated_at: now,
            });
        Ok(record.clone())
    }

    async fn expire_missing(
        &self,
        run_id: Uuid,
        owner_id: Uuid,
        source: &str,
        current_ids: &[String],
    ) -> StoreResult<u64> {
        self.check_job_writes()?;

        let now = Utc::now();
        let mut expired = 0;
        let mut inner = self.inner.lock().await;
        for job in inner.jobs.values_mut() {
            if job.owner_id == owner_id
                && job.source == source
                && job.status != JobStatus::Expired
                && !current_ids.contains(&job.external_id)
            {
                job.status = JobStatus::Expired;
                job.run_id = run_id;
                job.updated_at = now;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn get_job(&self, key: &JobKey) -> StoreResult<Option<JobRecord>> {
        Ok(self.inner.lock().await.jobs.get(key).cloned())
    }

    async fn pending_jobs(&self, run_id: Uuid) -> StoreResult<Vec<JobRecord>> {
        let inner = self.inner.lock().await;
        let mut pending: Vec<JobRecord> = inner
            .jobs
            .values()
            .filter(|job| job.run_id == run_id && job.status == JobStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            (&a.source, a.created_at, &a.external_id).cmp(&(&b.source, b.created_at, &b.external_id))
        });
        Ok(pending)
    }

    async fn job_progress(&self, run_id: Uuid) -> StoreResult<Vec<JobProgress>> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<JobProgress> = inner
            .jobs
            .values()
            .filter(|job| job.run_id == run_id)
            .map(JobProgress::from)
            .collect();
        rows.sort_by(|a, b| (&a.source, &a.external_id).cmp(&(&b.source, &b.external_id)));
        Ok(rows)
    }

    async fn count_jobs(&self, run_id: Uuid) -> StoreResult<JobCounts> {
        let inner = self.inner.lock().await;
        let mut counts = JobCounts::default();
        for job in inner.jobs.values().filter(|job| job.run_id == run_id) {
            counts.add(job.status, 1);
        }
        Ok(counts)
    }

    async fn complete_job(
        &self,
        key: &JobKey,
        run_id: Uuid,
        outcome: &CrawlOutcome,
    ) -> StoreResult<bool> {
        self.check_job_writes()?;

        let mut inner = self.inner.lock().await;
        let Some(job) = inner.jobs.get_mut(key) else {
            return Ok(false);
        };
        if job.run_id != run_id || job.status != JobStatus::Pending {
            return Ok(false);
        }

        match outcome {
            CrawlOutcome::Ready {
                fingerprint,
                raw_content_ref,
            } => {
                job.fingerprint = Some(*fingerprint);
                job.raw_content_ref = Some(raw_content_ref.clone());
                job.error_message = None;
            }
            CrawlOutcome::Skipped => {
                job.error_message = None;
            }
            CrawlOutcome::Failed { message } => {
                job.error_message = Some(message.clone());
            }
        }
        job.status = outcome.status();
        job.updated_at = Utc::now();
        Ok(true)
    }
}

#[async_trait]
impl SourceSettingsStore for MemoryStore {
    async fn enabled_sources(&self, owner_id: Uuid) -> StoreResult<Vec<SourceSetting>> {
        Ok(self
            .list_sources(owner_id)
            .await?
            .into_iter()
            .filter(|setting| setting.is_enabled)
            .collect())
    }

    async fn list_sources(&self, owner_id: Uuid) -> StoreResult<Vec<SourceSetting>> {
        Ok(self
            .inner
            .lock()
            .await
            .settings
            .values()
            .filter(|setting| setting.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn upsert_source(&self, setting: &SourceSetting) -> StoreResult<SourceSetting> {
        self.inner
            .lock()
            .await
            .settings
            .insert((setting.owner_id, setting.source.clone()), setting.clone());
        Ok(setting.clone())
    }

    async fn delete_source(&self, owner_id: Uuid, source: &str) -> StoreResult<bool> {
        Ok(self
            .inner
            .lock()
            .await
            .settings
            .remove(&(owner_id, source.to_string()))
            .is_some())
    }
}
