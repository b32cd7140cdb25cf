//! End-to-end pipeline scenarios.
//!
//! These drive the orchestrator, dispatcher and crawl worker together against
//! the in-memory store and queue:
//! 1. Build the job set from scripted listings
//! 2. Drain the dispatcher
//! 3. Inspect records, counters and run status

use std::sync::Arc;

use ingestion::circuit::{CIRCUIT_OPEN_MESSAGE, FAILURE_THRESHOLD, MAX_CRAWL_ATTEMPTS};
use ingestion::testing::{MemoryObjectStore, MockContentFetcher, MockListingFetcher};
use ingestion::{
    CrawlCommand, CrawlWorker, DispatcherConfig, Fingerprint, JobKey, JobRecord, JobRecordStore,
    JobStatus, ListingEntry, MemoryStore, MemoryWorkQueue, PipelineConfig, RunOrchestrator,
    RunStatus, RunStore, SourceSetting, SourceSettingsStore, StartOptions, WorkDispatcher,
    WorkQueue,
};
use ingestion::dispatch::NewWorkItem;
use uuid::Uuid;

struct Pipeline {
    owner_id: Uuid,
    store: Arc<MemoryStore>,
    listings: MockListingFetcher,
    pages: MockContentFetcher,
    objects: MemoryObjectStore,
    queue: Arc<MemoryWorkQueue>,
    orchestrator: RunOrchestrator,
    dispatcher: WorkDispatcher,
}

impl Pipeline {
    async fn new(sources: &[&str]) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let owner_id = Uuid::new_v4();
        let store = Arc::new(MemoryStore::new());
        let listings = MockListingFetcher::new();
        let pages = MockContentFetcher::new();
        let objects = MemoryObjectStore::new();
        let queue = Arc::new(MemoryWorkQueue::new());

        for source in sources {
            store
                .upsert_source(&SourceSetting::enabled(owner_id, *source))
                .await
                .unwrap();
        }

        let orchestrator =
            RunOrchestrator::new(store.clone(), Arc::new(listings.clone()), queue.clone());
        let worker = CrawlWorker::new(
            store.clone(),
            Arc::new(pages.clone()),
            Arc::new(objects.clone()),
        )
        .with_config(PipelineConfig::immediate());
        let dispatcher = WorkDispatcher::new(queue.clone(), DispatcherConfig::default())
            .with_handler(Arc::new(worker));

        Self {
            owner_id,
            store,
            listings,
            pages,
            objects,
            queue,
            orchestrator,
            dispatcher,
        }
    }

    /// Initialize a run and drain every crawl it dispatched.
    async fn run(&self) -> Uuid {
        let run = self.orchestrator.create_run(self.owner_id).await.unwrap();
        self.orchestrator
            .initialize(run.id, StartOptions::default())
            .await
            .unwrap();
        self.dispatcher.run_until_idle().await.unwrap();
        run.id
    }

    async fn job(&self, source: &str, external_id: &str) -> JobRecord {
        self.store
            .get_job(&JobKey::new(self.owner_id, source, external_id))
            .await
            .unwrap()
            .unwrap()
    }
}

fn posting(source: &str, external_id: &str) -> ListingEntry {
    ListingEntry::new(
        external_id,
        format!("Software Engineer {}", external_id),
        url(source, external_id),
    )
}

fn url(source: &str, external_id: &str) -> String {
    format!("https://{}.test/jobs/{}", source, external_id)
}

fn base_words() -> Vec<String> {
    (0..96).map(|i| format!("w{}", i)).collect()
}

/// Find a document whose fingerprint is exactly `distance` bits away from
/// `from`, by replacing a growing prefix of `words` with fresh tokens.
fn text_at_distance(words: &[String], from: Fingerprint, distance: u32) -> String {
    for seed in 0..2000 {
        for replaced in 1..=words.len() {
            let text = words
                .iter()
                .enumerate()
                .map(|(i, word)| {
                    if i < replaced {
                        format!("s{}x{}", seed, i)
                    } else {
                        word.clone()
                    }
                })
                .collect::<Vec<_>>()
                .join(" ");
            if Fingerprint::of_text(&text).distance(&from) == distance {
                return text;
            }
        }
    }
    panic!("no document found at distance {}", distance);
}

#[tokio::test]
async fn test_acme_fingerprint_scenario() {
    let pipeline = Pipeline::new(&["acme"]).await;
    pipeline.listings.set_listing("acme", vec![posting("acme", "J1")]);

    let words = base_words();
    let first_text = words.join(" ");
    let f1 = Fingerprint::of_text(&first_text);

    // Run 1: first fetch is stored
    pipeline.pages.set_page(url("acme", "J1"), first_text.clone());
    let run_1 = pipeline.run().await;
    let after_1 = pipeline.job("acme", "J1").await;
    assert_eq!(after_1.status, JobStatus::Ready);
    assert_eq!(after_1.fingerprint, Some(f1));
    let first_ref = after_1.raw_content_ref.clone().unwrap();

    // Run 2: one bit away, skipped
    let second_text = text_at_distance(&words, f1, 1);
    let f2 = Fingerprint::of_text(&second_text);
    pipeline.pages.set_page(url("acme", "J1"), second_text);
    let run_2 = pipeline.run().await;
    let after_2 = pipeline.job("acme", "J1").await;
    assert_eq!(after_2.status, JobStatus::Skipped);
    assert_eq!(after_2.run_id, run_2);
    assert_eq!(after_2.fingerprint, Some(f1));
    assert_eq!(after_2.raw_content_ref.as_deref(), Some(first_ref.as_str()));

    // Run 3: twelve bits away, stored again
    let third_text = text_at_distance(&words, f2, 12);
    let f3 = Fingerprint::of_text(&third_text);
    pipeline.pages.set_page(url("acme", "J1"), third_text);
    let run_3 = pipeline.run().await;
    let after_3 = pipeline.job("acme", "J1").await;
    assert_eq!(after_3.status, JobStatus::Ready);
    assert_eq!(after_3.fingerprint, Some(f3));
    assert_ne!(after_3.raw_content_ref.as_deref(), Some(first_ref.as_str()));

    for run_id in [run_1, run_2, run_3] {
        let report = pipeline.orchestrator.get_run_status(run_id).await.unwrap();
        assert_eq!(report.status, RunStatus::Finished);
    }
    assert_eq!(pipeline.objects.keys().len(), 2);
}

#[tokio::test]
async fn test_similarity_boundary() {
    let pipeline = Pipeline::new(&["acme"]).await;
    pipeline.listings.set_listing("acme", vec![posting("acme", "J1")]);

    let words = base_words();
    let original = words.join(" ");
    let stored = Fingerprint::of_text(&original);
    pipeline.pages.set_page(url("acme", "J1"), original.clone());
    pipeline.run().await;

    // Distance 0
    pipeline.run().await;
    assert_eq!(pipeline.job("acme", "J1").await.status, JobStatus::Skipped);

    // Distance 3
    pipeline
        .pages
        .set_page(url("acme", "J1"), text_at_distance(&words, stored, 3));
    pipeline.run().await;
    let record = pipeline.job("acme", "J1").await;
    assert_eq!(record.status, JobStatus::Skipped);
    assert_eq!(record.fingerprint, Some(stored));

    // Distance 4
    let changed = text_at_distance(&words, stored, 4);
    pipeline.pages.set_page(url("acme", "J1"), changed.clone());
    pipeline.run().await;
    let record = pipeline.job("acme", "J1").await;
    assert_eq!(record.status, JobStatus::Ready);
    assert_eq!(record.fingerprint, Some(Fingerprint::of_text(&changed)));
}

#[tokio::test]
async fn test_beta_circuit_breaker_scenario() {
    let pipeline = Pipeline::new(&["acme", "beta"]).await;
    let beta_ids: Vec<String> = (1..=6).map(|i| format!("B{}", i)).collect();
    pipeline.listings.set_listing(
        "beta",
        beta_ids.iter().map(|id| posting("beta", id)).collect(),
    );
    pipeline.listings.set_listing("acme", vec![posting("acme", "J1")]);
    pipeline.pages.set_page(url("acme", "J1"), "healthy source");

    for id in &beta_ids {
        pipeline.pages.set_failing_url(url("beta", id));
    }

    let run_id = pipeline.run().await;

    for id in &beta_ids[..5] {
        let record = pipeline.job("beta", id).await;
        assert_eq!(record.status, JobStatus::Error);
        assert_ne!(record.error_message.as_deref(), Some(CIRCUIT_OPEN_MESSAGE));
        assert_eq!(pipeline.pages.fetch_count(&url("beta", id)), MAX_CRAWL_ATTEMPTS);
    }

    let sixth = pipeline.job("beta", "B6").await;
    assert_eq!(sixth.status, JobStatus::Error);
    assert_eq!(sixth.error_message.as_deref(), Some(CIRCUIT_OPEN_MESSAGE));
    assert_eq!(pipeline.pages.fetch_count(&url("beta", "B6")), 0);

    assert_eq!(pipeline.job("acme", "J1").await.status, JobStatus::Ready);

    let gate = pipeline.store.run_gate(run_id, "beta").await.unwrap().unwrap();
    assert_eq!(gate.source_failures, FAILURE_THRESHOLD);
    let acme_gate = pipeline.store.run_gate(run_id, "acme").await.unwrap().unwrap();
    assert_eq!(acme_gate.source_failures, 0);

    let report = pipeline.orchestrator.get_run_status(run_id).await.unwrap();
    assert_eq!(report.status, RunStatus::Finished);
    assert_eq!(report.counts.error, 6);
    assert_eq!(report.counts.ready, 1);
    assert_eq!(report.counts.pending, 0);
}

#[tokio::test]
async fn test_upsert_is_idempotent_across_runs() {
    let pipeline = Pipeline::new(&["acme"]).await;
    pipeline.listings.set_listing(
        "acme",
        vec![posting("acme", "J1"), posting("acme", "J2")],
    );
    pipeline.pages.set_page(url("acme", "J1"), "one");
    pipeline.pages.set_page(url("acme", "J2"), "two");

    pipeline.run().await;
    let first_ids = (
        pipeline.job("acme", "J1").await.id,
        pipeline.job("acme", "J2").await.id,
    );
    pipeline.run().await;

    assert_eq!(pipeline.store.job_count().await, 2);
    assert_eq!(
        first_ids,
        (
            pipeline.job("acme", "J1").await.id,
            pipeline.job("acme", "J2").await.id
        )
    );
}

#[tokio::test]
async fn test_run_finishes_only_when_nothing_is_pending() {
    let pipeline = Pipeline::new(&["acme"]).await;
    pipeline.listings.set_listing(
        "acme",
        vec![posting("acme", "J1"), posting("acme", "J2")],
    );
    pipeline.pages.set_page(url("acme", "J1"), "one");
    pipeline.pages.set_page(url("acme", "J2"), "two");

    let run = pipeline.orchestrator.create_run(pipeline.owner_id).await.unwrap();
    let status = pipeline
        .orchestrator
        .initialize(run.id, StartOptions::default())
        .await
        .unwrap();
    assert_eq!(status, RunStatus::Ingesting);

    // Lose the head item: acknowledged without ever being handled
    let claimed = pipeline.queue.claim("test-worker", 10).await.unwrap();
    assert_eq!(claimed.len(), 1, "one item per partition at a time");
    assert!(pipeline.queue.mark_succeeded(&claimed[0]).await.unwrap());
    pipeline.dispatcher.run_until_idle().await.unwrap();

    let report = pipeline.orchestrator.get_run_status(run.id).await.unwrap();
    assert_eq!(report.counts.ready, 1);
    assert_eq!(report.counts.pending, 1);
    assert_eq!(report.status, RunStatus::Ingesting);

    // Recover the lost crawl
    let lost: CrawlCommand = claimed[0].deserialize().unwrap();
    let replay = NewWorkItem::for_command(&lost).unwrap();
    pipeline
        .queue
        .enqueue(NewWorkItem {
            dedupe_key: format!("{}-recovered", replay.dedupe_key),
            ..replay
        })
        .await
        .unwrap();
    pipeline.dispatcher.run_until_idle().await.unwrap();

    let report = pipeline.orchestrator.get_run_status(run.id).await.unwrap();
    assert_eq!(report.counts.pending, 0);
    assert_eq!(report.counts.ready, 2);
    assert_eq!(report.status, RunStatus::Finished);
}

#[tokio::test]
async fn test_redelivered_item_is_harmless() {
    let pipeline = Pipeline::new(&["acme"]).await;
    pipeline.listings.set_listing("acme", vec![posting("acme", "J1")]);
    pipeline.pages.set_page(url("acme", "J1"), "content");

    let run_id = pipeline.run().await;
    let once = pipeline.job("acme", "J1").await;

    let command = CrawlCommand::for_record(&once, false);
    let replay = NewWorkItem::for_command(&command).unwrap();
    assert!(!pipeline.queue.enqueue(replay.clone()).await.unwrap().is_created());

    let fresh = NewWorkItem {
        dedupe_key: format!("{}-replay", replay.dedupe_key),
        ..replay
    };
    pipeline.queue.enqueue(fresh).await.unwrap();
    assert_eq!(pipeline.dispatcher.run_until_idle().await.unwrap(), 1);

    let twice = pipeline.job("acme", "J1").await;
    assert_eq!(once, twice);
    assert_eq!(pipeline.pages.fetch_count(&url("acme", "J1")), 1);

    let report = pipeline.orchestrator.get_run_status(run_id).await.unwrap();
    assert_eq!(report.status, RunStatus::Finished);
}
