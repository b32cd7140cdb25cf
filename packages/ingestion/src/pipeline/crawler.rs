//! Crawl worker: fetches one posting, deduplicates it by fingerprint and
//! writes the outcome back to its job record.
//!
//! ```text
//! CrawlCommand
//!     │
//!     ├─► run gate (status + source failures, one lookup)
//!     │       ├─ run terminal ──────────────► no-op
//!     │       └─ circuit open ──────────────► error "source circuit open"
//!     ├─► redelivery guard (record pending for this run?)
//!     ├─► fetch with retry (3 attempts, fixed delay)
//!     │       └─ exhausted ─► failures += 1 ► error
//!     ├─► fingerprint: similar ─────────────► skipped
//!     │                different ───────────► put raw content ► ready
//!     ├─► complete job (guarded write) ► try finalize run
//!     └─► throttle (every path except a closed run)
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::circuit::{CircuitDecision, CIRCUIT_OPEN_MESSAGE, MAX_CRAWL_ATTEMPTS};
use crate::config::PipelineConfig;
use crate::dispatch::{WorkCommand, WorkHandler, WorkItem};
use crate::error::{FetchResult, Result};
use crate::fingerprint::{is_similar, Fingerprint};
use crate::traits::collaborators::{ContentFetcher, ObjectStore};
use crate::traits::store::IngestionStore;
use crate::types::{CrawlOutcome, JobKey, JobRecord, JobStatus};

/// Command type of crawl work items.
pub const CRAWL_COMMAND_TYPE: &str = "ingestion:crawl_job";

/// Hex characters of the content digest kept in raw object keys.
const CONTENT_DIGEST_PREFIX_LEN: usize = 16;

// ============================================================================
// Command
// ============================================================================

/// One dispatched crawl of one job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlCommand {
    pub run_id: Uuid,
    pub owner_id: Uuid,
    pub source: String,
    pub external_id: String,
    pub url: String,
    /// Store content even when it matches the previous fingerprint
    #[serde(default)]
    pub force: bool,
}

impl CrawlCommand {
    pub fn for_record(record: &JobRecord, force: bool) -> Self {
        Self {
            run_id: record.run_id,
            owner_id: record.owner_id,
            source: record.source.clone(),
            external_id: record.external_id.clone(),
            url: record.url.clone(),
            force,
        }
    }

    pub fn key(&self) -> JobKey {
        JobKey::new(self.owner_id, self.source.clone(), self.external_id.clone())
    }
}

impl WorkCommand for CrawlCommand {
    fn command_type(&self) -> &'static str {
        CRAWL_COMMAND_TYPE
    }

    fn partition_key(&self) -> String {
        self.source.clone()
    }

    fn dedupe_key(&self) -> String {
        format!("{}:{}:{}", self.run_id, self.source, self.external_id)
    }
}

/// Object key for a posting's raw content.
///
/// Keys are content-addressed, so storing identical bytes twice lands on the
/// same object.
pub fn raw_content_key(owner_id: Uuid, source: &str, external_id: &str, content: &[u8]) -> String {
    let digest = hex::encode(Sha256::digest(content));
    format!(
        "raw/{}/{}/{}/{}.html",
        owner_id,
        source,
        external_id.replace('/', "_"),
        &digest[..CONTENT_DIGEST_PREFIX_LEN]
    )
}

// ============================================================================
// Worker
// ============================================================================

/// What a crawl did with its command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlDisposition {
    /// Run is missing or terminal; nothing was touched
    RunClosed,
    /// Record was already resolved or belongs to another run
    Stale,
    /// Outcome written to the record
    Completed(JobStatus),
}

pub struct CrawlWorker {
    store: Arc<dyn IngestionStore>,
    fetcher: Arc<dyn ContentFetcher>,
    objects: Arc<dyn ObjectStore>,
    config: PipelineConfig,
}

impl CrawlWorker {
    pub fn new(
        store: Arc<dyn IngestionStore>,
        fetcher: Arc<dyn ContentFetcher>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            store,
            fetcher,
            objects,
            config: PipelineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Process one crawl command.
    ///
    /// Job-level failures are written to the record and reported as
    /// `Completed(JobStatus::Error)`; only storage failures return `Err`.
    /// Every crawl of an open run ends with the throttle delay, stale
    /// redeliveries and failed writes included.
    pub async fn crawl(&self, command: &CrawlCommand) -> Result<CrawlDisposition> {
        let result = self.crawl_once(command).await;
        if !matches!(result, Ok(CrawlDisposition::RunClosed)) {
            tokio::time::sleep(self.config.crawl_throttle).await;
        }
        result
    }

    async fn crawl_once(&self, command: &CrawlCommand) -> Result<CrawlDisposition> {
        let run_id = command.run_id;

        let Some(gate) = self.store.run_gate(run_id, &command.source).await? else {
            debug!(run_id = %run_id, "run not found, dropping crawl");
            return Ok(CrawlDisposition::RunClosed);
        };

        let decision = CircuitDecision::for_gate(&gate);
        if decision == CircuitDecision::RunClosed {
            debug!(run_id = %run_id, status = %gate.status, "run closed, dropping crawl");
            return Ok(CrawlDisposition::RunClosed);
        }

        let key = command.key();
        let record = self.store.get_job(&key).await?;
        let Some(record) = record.filter(|r| r.run_id == run_id && r.status == JobStatus::Pending)
        else {
            debug!(run_id = %run_id, job = %key, "job already resolved, skipping redelivery");
            self.finalize(run_id).await?;
            return Ok(CrawlDisposition::Stale);
        };

        let outcome = match decision {
            CircuitDecision::Open => {
                debug!(run_id = %run_id, source = %command.source, "source circuit open");
                CrawlOutcome::failed(CIRCUIT_OPEN_MESSAGE)
            }
            _ => self.fetch_and_store(command, &record).await?,
        };

        let applied = self.store.complete_job(&key, run_id, &outcome).await?;
        if applied {
            info!(
                run_id = %run_id,
                source = %command.source,
                external_id = %command.external_id,
                status = %outcome.status(),
                "job crawled"
            );
        }

        self.finalize(run_id).await?;

        Ok(if applied {
            CrawlDisposition::Completed(outcome.status())
        } else {
            CrawlDisposition::Stale
        })
    }

    async fn fetch_and_store(
        &self,
        command: &CrawlCommand,
        record: &JobRecord,
    ) -> Result<CrawlOutcome> {
        let content = match self.fetch_with_retry(&command.url).await {
            Ok(content) => content,
            Err(e) => return self.record_source_failure(command, e.to_string()).await,
        };

        let fingerprint = Fingerprint::of(&content);
        if !command.force && is_similar(record.fingerprint, Some(fingerprint)) {
            debug!(
                external_id = %command.external_id,
                fingerprint = %fingerprint,
                "content unchanged"
            );
            return Ok(CrawlOutcome::Skipped);
        }

        let key = raw_content_key(command.owner_id, &command.source, &command.external_id, &content);
        match self.objects.put(&key, &content).await {
            Ok(raw_content_ref) => Ok(CrawlOutcome::Ready {
                fingerprint,
                raw_content_ref,
            }),
            Err(e) => {
                self.record_source_failure(command, format!("failed to store raw content: {}", e))
                    .await
            }
        }
    }

    async fn fetch_with_retry(&self, url: &str) -> FetchResult<Bytes> {
        let mut attempt = 1;
        loop {
            match self.fetcher.fetch(url).await {
                Ok(content) => return Ok(content),
                Err(e) if attempt < MAX_CRAWL_ATTEMPTS => {
                    warn!(url = %url, attempt, error = %e, "fetch failed, retrying");
                    tokio::time::sleep(self.config.retry_delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn record_source_failure(
        &self,
        command: &CrawlCommand,
        message: String,
    ) -> Result<CrawlOutcome> {
        let failures = self
            .store
            .increment_source_failures(command.run_id, &command.source)
            .await?;
        warn!(
            run_id = %command.run_id,
            source = %command.source,
            external_id = %command.external_id,
            failures,
            error = %message,
            "crawl failed"
        );
        Ok(CrawlOutcome::failed(message))
    }

    async fn finalize(&self, run_id: Uuid) -> Result<()> {
        if self.store.try_finalize_run(run_id).await? {
            info!(run_id = %run_id, "ingestion run finished");
        }
        Ok(())
    }
}

#[async_trait]
impl WorkHandler for CrawlWorker {
    fn command_type(&self) -> &'static str {
        CRAWL_COMMAND_TYPE
    }

    async fn handle(&self, item: &WorkItem) -> Result<()> {
        let command: CrawlCommand = item.deserialize()?;
        self.crawl(&command).await.map(|_| ())
    }

    /// The queue gave up on this crawl; record it so the run can finish.
    async fn on_dead_letter(&self, item: &WorkItem, error: &str) -> Result<()> {
        let command: CrawlCommand = item.deserialize()?;
        let run_id = command.run_id;

        let open = self
            .store
            .run_gate(run_id, &command.source)
            .await?
            .is_some_and(|gate| !gate.status.is_terminal());
        if !open {
            return Ok(());
        }

        let outcome = CrawlOutcome::failed(format!("crawl abandoned: {}", error));
        if self.store.complete_job(&command.key(), run_id, &outcome).await? {
            warn!(
                run_id = %run_id,
                source = %command.source,
                external_id = %command.external_id,
                error = %error,
                "crawl dead-lettered, job marked error"
            );
        }
        self.finalize(run_id).await
    }
}
