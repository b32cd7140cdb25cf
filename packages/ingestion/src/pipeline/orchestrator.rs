//! Run orchestrator: owns the run-level state machine.
//!
//! ```text
//! start ──► pending ──► initializing ──► ingesting ──► finished
//!              │              │               (crawl workers)
//!              └──────────────┴──► error
//! ```
//!
//! Initialization reads the owner's enabled sources, fetches each listing,
//! upserts one pending record per posting and expires records that left the
//! listing. Once the job set is built the run moves to `ingesting` and one
//! crawl item per pending record is enqueued, partitioned by source.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::crawler::CrawlCommand;
use crate::dispatch::{NewWorkItem, WorkQueue};
use crate::error::{IngestionError, Result, StoreError};
use crate::traits::collaborators::ListingFetcher;
use crate::traits::store::IngestionStore;
use crate::types::{IngestionRun, InitializationSummary, RunStatus, RunStatusReport};

/// Options for a new ingestion run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartOptions {
    /// Store every fetched posting, even when its content is unchanged
    #[serde(default)]
    pub force: bool,
}

impl StartOptions {
    pub fn forced() -> Self {
        Self { force: true }
    }
}

/// Catastrophic initialization failures. Each moves the run to `error`.
#[derive(Debug, Error)]
enum InitializationError {
    #[error("no enabled sources configured")]
    NoSources,

    #[error("listing fetch failed for all sources: {}", .0.join("; "))]
    AllListingsFailed(Vec<String>),

    #[error("store unavailable during initialization: {0}")]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct RunOrchestrator {
    store: Arc<dyn IngestionStore>,
    listings: Arc<dyn ListingFetcher>,
    queue: Arc<dyn WorkQueue>,
}

impl RunOrchestrator {
    pub fn new(
        store: Arc<dyn IngestionStore>,
        listings: Arc<dyn ListingFetcher>,
        queue: Arc<dyn WorkQueue>,
    ) -> Self {
        Self {
            store,
            listings,
            queue,
        }
    }

    /// Create a run in `pending` and initialize it in the background.
    ///
    /// Returns as soon as the run exists; progress is observed through
    /// [`get_run_status`](Self::get_run_status) or a progress stream.
    pub async fn start(&self, owner_id: Uuid, options: StartOptions) -> Result<Uuid> {
        let run = self.create_run(owner_id).await?;
        let run_id = run.id;

        let orchestrator = self.clone();
        tokio::spawn(async move {
            if let Err(e) = orchestrator.initialize(run_id, options).await {
                error!(run_id = %run_id, error = %e, "ingestion run initialization failed");
            }
        });

        Ok(run_id)
    }

    /// Create a run in `pending` without initializing it.
    pub async fn create_run(&self, owner_id: Uuid) -> Result<IngestionRun> {
        let run = self.store.create_run(owner_id).await?;
        info!(run_id = %run.id, owner_id = %owner_id, "ingestion run created");
        Ok(run)
    }

    /// Re-initialize every run a previous process left unfinished.
    ///
    /// Call once at startup. Each run goes through [`initialize`](Self::initialize)
    /// with default options; a failure on one run is logged and the rest are
    /// still resumed. Returns how many runs were resumed without error.
    pub async fn resume_unfinished(&self) -> Result<usize> {
        let runs = self.store.unfinished_runs().await?;
        if runs.is_empty() {
            return Ok(0);
        }
        info!(count = runs.len(), "resuming unfinished ingestion runs");

        let mut resumed = 0;
        for run in runs {
            match self.initialize(run.id, StartOptions::default()).await {
                Ok(status) => {
                    info!(
                        run_id = %run.id,
                        from = %run.status,
                        status = %status,
                        "ingestion run resumed"
                    );
                    resumed += 1;
                }
                Err(e) => {
                    error!(run_id = %run.id, error = %e, "failed to resume ingestion run");
                }
            }
        }
        Ok(resumed)
    }

    /// Build the job set for a run and dispatch its crawls.
    ///
    /// Safe to call again after a crash: a run still `pending` or
    /// `initializing` redoes the whole phase, an `ingesting` run only
    /// re-enqueues its pending records (the dispatcher collapses duplicates)
    /// and a terminal run is left alone. Returns the run status afterwards.
    pub async fn initialize(&self, run_id: Uuid, options: StartOptions) -> Result<RunStatus> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or(IngestionError::RunNotFound(run_id))?;

        match run.status {
            RunStatus::Pending | RunStatus::Initializing => {}
            RunStatus::Ingesting => {
                self.dispatch_pending(run_id, options).await?;
                return self.current_status(run_id).await;
            }
            status => {
                debug!(run_id = %run_id, status = %status, "run already terminal");
                return Ok(status);
            }
        }

        let entered = self
            .store
            .transition_run(
                run_id,
                &[RunStatus::Pending, RunStatus::Initializing],
                RunStatus::Initializing,
            )
            .await?;
        if !entered {
            return self.current_status(run_id).await;
        }
        info!(run_id = %run_id, status = %RunStatus::Initializing, "ingestion run initializing");

        match self.build_job_set(&run).await {
            Ok(summary) => {
                info!(
                    run_id = %run_id,
                    total_jobs = summary.total_jobs,
                    jobs_expired = summary.jobs_expired,
                    "job set built"
                );
            }
            Err(e) => {
                let message = e.to_string();
                error!(run_id = %run_id, error = %message, "ingestion run failed");
                if let Err(store_error) = self.store.fail_run(run_id, &message).await {
                    error!(run_id = %run_id, error = %store_error, "failed to record run error");
                    return Err(store_error.into());
                }
                return Ok(RunStatus::Error);
            }
        }

        let ingesting = self
            .store
            .transition_run(run_id, &[RunStatus::Initializing], RunStatus::Ingesting)
            .await?;
        if !ingesting {
            return self.current_status(run_id).await;
        }
        info!(run_id = %run_id, status = %RunStatus::Ingesting, "ingestion run ingesting");

        self.dispatch_pending(run_id, options).await?;
        self.current_status(run_id).await
    }

    /// Move a non-terminal run to `aborted`.
    ///
    /// Crawl items already queued are dropped by the workers. Returns false
    /// when the run had already reached a terminal status.
    pub async fn abort(&self, run_id: Uuid) -> Result<bool> {
        if self.store.get_run(run_id).await?.is_none() {
            return Err(IngestionError::RunNotFound(run_id));
        }

        let aborted = self
            .store
            .transition_run(
                run_id,
                &[
                    RunStatus::Pending,
                    RunStatus::Initializing,
                    RunStatus::Ingesting,
                ],
                RunStatus::Aborted,
            )
            .await?;
        if aborted {
            info!(run_id = %run_id, "ingestion run aborted");
        }
        Ok(aborted)
    }

    /// Point-in-time status with per-status job counts.
    pub async fn get_run_status(&self, run_id: Uuid) -> Result<RunStatusReport> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or(IngestionError::RunNotFound(run_id))?;
        let counts = self.store.count_jobs(run_id).await?;
        Ok(RunStatusReport::new(&run, counts))
    }

    async fn build_job_set(
        &self,
        run: &IngestionRun,
    ) -> std::result::Result<InitializationSummary, InitializationError> {
        let sources = self.store.enabled_sources(run.owner_id).await?;
        if sources.is_empty() {
            return Err(InitializationError::NoSources);
        }

        let mut summary = InitializationSummary::default();
        let mut failures = Vec::new();
        let mut listed = 0;

        for setting in &sources {
            let source = setting.source.as_str();
            let entries = match self
                .listings
                .fetch_listing(source, &setting.title_filters)
                .await
            {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(run_id = %run.id, source = %source, error = %e, "listing fetch failed");
                    failures.push(format!("{}: {}", source, e));
                    continue;
                }
            };

            for entry in &entries {
                self.store
                    .upsert_job(run.id, run.owner_id, source, entry)
                    .await?;
            }

            let current_ids: Vec<String> =
                entries.iter().map(|entry| entry.external_id.clone()).collect();
            let expired = self
                .store
                .expire_missing(run.id, run.owner_id, source, &current_ids)
                .await?;

            debug!(
                run_id = %run.id,
                source = %source,
                jobs = entries.len(),
                expired,
                "source listed"
            );
            summary.total_jobs += entries.len() as i64;
            summary.jobs_expired += expired as i64;
            listed += 1;
        }

        if listed == 0 {
            return Err(InitializationError::AllListingsFailed(failures));
        }

        self.store.record_initialization(run.id, summary).await?;
        Ok(summary)
    }

    async fn dispatch_pending(&self, run_id: Uuid, options: StartOptions) -> Result<()> {
        let pending = self.store.pending_jobs(run_id).await?;

        let mut created = 0;
        for record in &pending {
            let command = CrawlCommand::for_record(record, options.force);
            let item = NewWorkItem::for_command(&command)?;
            if self.queue.enqueue(item).await?.is_created() {
                created += 1;
            }
        }
        info!(
            run_id = %run_id,
            pending = pending.len(),
            enqueued = created,
            duplicates = pending.len() - created,
            "crawl jobs dispatched"
        );

        if self.store.try_finalize_run(run_id).await? {
            info!(run_id = %run_id, "ingestion run finished");
        }
        Ok(())
    }

    async fn current_status(&self, run_id: Uuid) -> Result<RunStatus> {
        self.store
            .get_run(run_id)
            .await?
            .map(|run| run.status)
            .ok_or(IngestionError::RunNotFound(run_id))
    }
}
