//! Snapshot-then-diff progress streams.
//!
//! A subscription polls the run on a fixed interval. Before ingestion starts
//! it reports the run status on every tick. The first `ingesting` tick sends
//! the full job set (`all_jobs`); later ticks send only the jobs whose status
//! changed (`update`). When the run turns terminal the stream sends any last
//! changes, a final `status` and closes.
//!
//! The diff cursor lives in the subscription, so a reconnect always starts
//! over with a full snapshot.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::error::{IngestionError, Result};
use crate::traits::store::IngestionStore;
use crate::types::{JobProgress, JobStatus, RunStatus};

// ============================================================================
// Events
// ============================================================================

/// Snapshot row for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub external_id: String,
    pub title: String,
    pub status: JobStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Run status, sent before ingestion and once more when the run ends
    Status {
        status: RunStatus,
        error_message: Option<String>,
    },
    /// Every job of the run, grouped by source and ordered by external id
    AllJobs(BTreeMap<String, Vec<JobSnapshot>>),
    /// `source -> external_id -> status` for jobs changed since the last tick
    Update(BTreeMap<String, BTreeMap<String, JobStatus>>),
}

impl ProgressEvent {
    /// Event name on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            ProgressEvent::Status { .. } => "status",
            ProgressEvent::AllJobs(_) => "all_jobs",
            ProgressEvent::Update(_) => "update",
        }
    }

    /// JSON payload on the wire.
    pub fn data(&self) -> serde_json::Value {
        match self {
            ProgressEvent::Status {
                status,
                error_message,
            } => match error_message {
                Some(message) => json!({ "status": status, "error_message": message }),
                None => json!({ "status": status }),
            },
            ProgressEvent::AllJobs(jobs) => json!(jobs),
            ProgressEvent::Update(changes) => json!(changes),
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, ProgressEvent::Status { status, .. } if status.is_terminal())
    }
}

// ============================================================================
// Cursor
// ============================================================================

/// Per-subscription diff cursor.
///
/// Feed it one observation per tick; it returns the events for that tick.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    baseline: Option<HashMap<(String, String), JobStatus>>,
    closed: bool,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the next tick at `status` needs the job rows.
    pub fn needs_jobs(&self, status: RunStatus) -> bool {
        match status {
            RunStatus::Pending | RunStatus::Initializing => false,
            RunStatus::Ingesting => true,
            _ => self.baseline.is_some(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn observe(
        &mut self,
        status: RunStatus,
        error_message: Option<&str>,
        jobs: &[JobProgress],
    ) -> Vec<ProgressEvent> {
        if self.closed {
            return Vec::new();
        }

        match status {
            RunStatus::Pending | RunStatus::Initializing => vec![ProgressEvent::Status {
                status,
                error_message: None,
            }],
            RunStatus::Ingesting => {
                if self.baseline.is_none() {
                    vec![self.snapshot(jobs)]
                } else {
                    self.diff(jobs).into_iter().collect()
                }
            }
            _ => {
                let mut events: Vec<ProgressEvent> = if self.baseline.is_some() {
                    self.diff(jobs).into_iter().collect()
                } else {
                    Vec::new()
                };
                events.push(ProgressEvent::Status {
                    status,
                    error_message: error_message.map(str::to_string),
                });
                self.closed = true;
                events
            }
        }
    }

    fn snapshot(&mut self, jobs: &[JobProgress]) -> ProgressEvent {
        let mut grouped: BTreeMap<String, Vec<JobSnapshot>> = BTreeMap::new();
        let mut baseline = HashMap::with_capacity(jobs.len());

        for job in jobs {
            grouped.entry(job.source.clone()).or_default().push(JobSnapshot {
                external_id: job.external_id.clone(),
                title: job.title.clone(),
                status: job.status,
            });
            baseline.insert((job.source.clone(), job.external_id.clone()), job.status);
        }
        for rows in grouped.values_mut() {
            rows.sort_by(|a, b| a.external_id.cmp(&b.external_id));
        }

        self.baseline = Some(baseline);
        ProgressEvent::AllJobs(grouped)
    }

    fn diff(&mut self, jobs: &[JobProgress]) -> Option<ProgressEvent> {
        let baseline = self.baseline.get_or_insert_with(HashMap::new);
        let mut changes: BTreeMap<String, BTreeMap<String, JobStatus>> = BTreeMap::new();

        for job in jobs {
            let key = (job.source.clone(), job.external_id.clone());
            if baseline.get(&key) == Some(&job.status) {
                continue;
            }
            changes
                .entry(job.source.clone())
                .or_default()
                .insert(job.external_id.clone(), job.status);
            baseline.insert(key, job.status);
        }

        (!changes.is_empty()).then_some(ProgressEvent::Update(changes))
    }
}

// ============================================================================
// Streamer
// ============================================================================

pub struct ProgressStreamer {
    store: Arc<dyn IngestionStore>,
    poll_interval: Duration,
}

impl ProgressStreamer {
    pub fn new(store: Arc<dyn IngestionStore>, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval,
        }
    }

    /// Subscribe to a run's progress.
    ///
    /// The first tick runs immediately. The stream ends after the final
    /// status event, or with an error if the run disappears or the store
    /// fails.
    pub fn subscribe(&self, run_id: Uuid) -> impl Stream<Item = Result<ProgressEvent>> + Send + 'static {
        let store = self.store.clone();
        let poll_interval = self.poll_interval;

        async_stream::try_stream! {
            let mut tracker = ProgressTracker::new();
            let mut ticks: u64 = 0;

            loop {
                if ticks > 0 {
                    tokio::time::sleep(poll_interval).await;
                }
                ticks += 1;

                let run = store
                    .get_run(run_id)
                    .await
                    .map_err(IngestionError::from)?
                    .ok_or(IngestionError::RunNotFound(run_id))?;

                let jobs = if tracker.needs_jobs(run.status) {
                    store.job_progress(run_id).await.map_err(IngestionError::from)?
                } else {
                    Vec::new()
                };

                for event in tracker.observe(run.status, run.error_message.as_deref(), &jobs) {
                    yield event;
                }

                if tracker.is_closed() {
                    debug!(run_id = %run_id, ticks, "progress stream closed");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::stores::MemoryStore;
    use crate::traits::store::{JobRecordStore, RunStore};
    use crate::types::{CrawlOutcome, JobKey, ListingEntry};

    fn progress(source: &str, external_id: &str, status: JobStatus) -> JobProgress {
        JobProgress {
            source: source.to_string(),
            external_id: external_id.to_string(),
            title: format!("Job {}", external_id),
            status,
        }
    }

    #[test]
    fn test_status_before_ingesting() {
        let mut tracker = ProgressTracker::new();
        assert!(!tracker.needs_jobs(RunStatus::Pending));

        let events = tracker.observe(RunStatus::Pending, None, &[]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "status");
        assert_eq!(events[0].data(), json!({ "status": "pending" }));

        let events = tracker.observe(RunStatus::Initializing, None, &[]);
        assert_eq!(events[0].data(), json!({ "status": "initializing" }));
    }

    #[test]
    fn test_first_ingesting_tick_is_full_snapshot() {
        let mut tracker = ProgressTracker::new();
        let jobs = vec![
            progress("acme", "J2", JobStatus::Pending),
            progress("acme", "J1", JobStatus::Ready),
            progress("beta", "B1", JobStatus::Pending),
        ];

        let events = tracker.observe(RunStatus::Ingesting, None, &jobs);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "all_jobs");
        assert_eq!(
            events[0].data(),
            json!({
                "acme": [
                    { "external_id": "J1", "title": "Job J1", "status": "ready" },
                    { "external_id": "J2", "title": "Job J2", "status": "pending" },
                ],
                "beta": [
                    { "external_id": "B1", "title": "Job B1", "status": "pending" },
                ],
            })
        );
    }

    #[test]
    fn test_later_ticks_send_only_changes() {
        let mut tracker = ProgressTracker::new();
        let mut jobs = vec![
            progress("acme", "J1", JobStatus::Pending),
            progress("acme", "J2", JobStatus::Pending),
        ];
        tracker.observe(RunStatus::Ingesting, None, &jobs);

        assert!(tracker.observe(RunStatus::Ingesting, None, &jobs).is_empty());

        jobs[1].status = JobStatus::Skipped;
        let events = tracker.observe(RunStatus::Ingesting, None, &jobs);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "update");
        assert_eq!(events[0].data(), json!({ "acme": { "J2": "skipped" } }));

        assert!(tracker.observe(RunStatus::Ingesting, None, &jobs).is_empty());
    }

    #[test]
    fn test_terminal_tick_flushes_changes_then_closes() {
        let mut tracker = ProgressTracker::new();
        let mut jobs = vec![progress("acme", "J1", JobStatus::Pending)];
        tracker.observe(RunStatus::Ingesting, None, &jobs);

        jobs[0].status = JobStatus::Error;
        assert!(tracker.needs_jobs(RunStatus::Finished));
        let events = tracker.observe(RunStatus::Finished, None, &jobs);

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data(), json!({ "acme": { "J1": "error" } }));
        assert_eq!(events[1].data(), json!({ "status": "finished" }));
        assert!(events[1].is_final());
        assert!(tracker.is_closed());
        assert!(tracker.observe(RunStatus::Finished, None, &jobs).is_empty());
    }

    #[test]
    fn test_error_status_carries_message() {
        let mut tracker = ProgressTracker::new();
        assert!(!tracker.needs_jobs(RunStatus::Error));

        let events = tracker.observe(RunStatus::Error, Some("no enabled sources configured"), &[]);
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].data(),
            json!({ "status": "error", "error_message": "no enabled sources configured" })
        );
    }

    async fn ingesting_run_with_jobs(store: &MemoryStore) -> (Uuid, Uuid) {
        let owner = Uuid::new_v4();
        let run = store.create_run(owner).await.unwrap();
        for id in ["J1", "J2"] {
            store
                .upsert_job(run.id, owner, "acme", &ListingEntry::new(id, format!("Job {}", id), "https://acme.test"))
                .await
                .unwrap();
        }
        store
            .transition_run(run.id, &[RunStatus::Pending], RunStatus::Initializing)
            .await
            .unwrap();
        store
            .transition_run(run.id, &[RunStatus::Initializing], RunStatus::Ingesting)
            .await
            .unwrap();
        (run.id, owner)
    }

    #[tokio::test]
    async fn test_stream_snapshot_then_diff_and_reconnect() {
        let store = Arc::new(MemoryStore::new());
        let (run_id, owner) = ingesting_run_with_jobs(&store).await;
        let streamer = ProgressStreamer::new(store.clone(), Duration::from_millis(1));

        let mut stream = Box::pin(streamer.subscribe(run_id));
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.name(), "all_jobs");

        store
            .complete_job(&JobKey::new(owner, "acme", "J1"), run_id, &CrawlOutcome::Skipped)
            .await
            .unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second, ProgressEvent::Update(BTreeMap::from([(
            "acme".to_string(),
            BTreeMap::from([("J1".to_string(), JobStatus::Skipped)]),
        )])));

        let mut reconnected = Box::pin(streamer.subscribe(run_id));
        let first_again = reconnected.next().await.unwrap().unwrap();
        assert_eq!(first_again.name(), "all_jobs");

        store
            .complete_job(&JobKey::new(owner, "acme", "J2"), run_id, &CrawlOutcome::failed("HTTP 500"))
            .await
            .unwrap();
        assert!(store.try_finalize_run(run_id).await.unwrap());

        let rest: Vec<ProgressEvent> = stream.map(|event| event.unwrap()).collect().await;
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].data(), json!({ "acme": { "J2": "error" } }));
        assert_eq!(rest[1].data(), json!({ "status": "finished" }));
    }

    #[tokio::test]
    async fn test_stream_unknown_run_errors() {
        let streamer = ProgressStreamer::new(Arc::new(MemoryStore::new()), Duration::from_millis(1));
        let mut stream = Box::pin(streamer.subscribe(Uuid::new_v4()));

        assert!(matches!(
            stream.next().await,
            Some(Err(IngestionError::RunNotFound(_)))
        ));
        assert!(stream.next().await.is_none());
    }
}
