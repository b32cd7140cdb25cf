//! PostgreSQL integration tests.
//!
//! Exercise the SQL store and work queue against the real schema. These
//! need Docker; run with `cargo test -- --ignored`.

mod common;

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use common::{create_test_owner, listing_entry, page_url, TestHarness};
use ingestion::circuit::{CIRCUIT_OPEN_MESSAGE, FAILURE_THRESHOLD};
use ingestion::dispatch::{NewWorkItem, WorkItemStatus};
use ingestion::testing::{MemoryObjectStore, MockContentFetcher, MockListingFetcher};
use ingestion::{
    CrawlOutcome, CrawlWorker, DispatcherConfig, Fingerprint, JobKey, JobRecordStore, JobStatus,
    PipelineConfig, PostgresWorkQueue, RunOrchestrator, RunStatus, RunStore, StartOptions,
    WorkDispatcher, WorkQueue,
};
use test_context::test_context;

fn queue_item(partition: &str, dedupe: &str) -> NewWorkItem {
    NewWorkItem::builder()
        .command_type("test:noop")
        .partition_key(partition)
        .dedupe_key(dedupe)
        .payload(serde_json::json!({}))
        .build()
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires docker"]
async fn test_run_transitions_are_guarded(ctx: &TestHarness) {
    let store = ctx.store();
    let owner_id = create_test_owner(store.as_ref(), &["acme"]).await.unwrap();

    let run = store.create_run(owner_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Pending);

    assert!(store
        .transition_run(run.id, &[RunStatus::Pending], RunStatus::Initializing)
        .await
        .unwrap());
    // Stale source status
    assert!(!store
        .transition_run(run.id, &[RunStatus::Pending], RunStatus::Ingesting)
        .await
        .unwrap());

    let long_message = "x".repeat(900);
    assert!(store.fail_run(run.id, &long_message).await.unwrap());

    let run = store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Error);
    assert_eq!(run.error_message.unwrap().chars().count(), 500);
    assert!(run.started_at.is_some());
    assert!(run.finished_at.is_some());

    // Terminal runs never move again
    assert!(!store
        .transition_run(
            run.id,
            &[RunStatus::Pending, RunStatus::Initializing, RunStatus::Ingesting],
            RunStatus::Aborted,
        )
        .await
        .unwrap());
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires docker"]
async fn test_unfinished_runs_excludes_terminal(ctx: &TestHarness) {
    let store = ctx.store();
    let owner_id = create_test_owner(store.as_ref(), &["acme"]).await.unwrap();

    let pending = store.create_run(owner_id).await.unwrap();
    let ingesting = store.create_run(owner_id).await.unwrap();
    store
        .transition_run(ingesting.id, &[RunStatus::Pending], RunStatus::Ingesting)
        .await
        .unwrap();
    let aborted = store.create_run(owner_id).await.unwrap();
    store
        .transition_run(aborted.id, &[RunStatus::Pending], RunStatus::Aborted)
        .await
        .unwrap();

    let mut ids: Vec<_> = store
        .unfinished_runs()
        .await
        .unwrap()
        .into_iter()
        .map(|run| run.id)
        .collect();
    ids.sort();
    let mut expected = vec![pending.id, ingesting.id];
    expected.sort();
    assert_eq!(ids, expected);
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires docker"]
async fn test_source_failure_counter_is_atomic(ctx: &TestHarness) {
    let store = ctx.store();
    let owner_id = create_test_owner(store.as_ref(), &["beta"]).await.unwrap();
    let run = store.create_run(owner_id).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let store = store.clone();
        let run_id = run.id;
        handles.push(tokio::spawn(async move {
            store.increment_source_failures(run_id, "beta").await.unwrap()
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let gate = store.run_gate(run.id, "beta").await.unwrap().unwrap();
    assert_eq!(gate.source_failures, 10);
    let other = store.run_gate(run.id, "acme").await.unwrap().unwrap();
    assert_eq!(other.source_failures, 0);
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires docker"]
async fn test_upsert_keeps_fingerprint_and_expires_missing(ctx: &TestHarness) {
    let store = ctx.store();
    let owner_id = create_test_owner(store.as_ref(), &["acme"]).await.unwrap();

    let run1 = store.create_run(owner_id).await.unwrap();
    for id in ["A1", "A2"] {
        store
            .upsert_job(run1.id, owner_id, "acme", &listing_entry("acme", id, "Engineer"))
            .await
            .unwrap();
    }

    let key = JobKey::new(owner_id, "acme", "A1");
    let fingerprint = Fingerprint::of_text("senior rust engineer remote");
    let outcome = CrawlOutcome::Ready {
        fingerprint,
        raw_content_ref: "file://raw/a1.html".to_string(),
    };
    assert!(store.complete_job(&key, run1.id, &outcome).await.unwrap());
    // Second write is a no-op
    assert!(!store.complete_job(&key, run1.id, &outcome).await.unwrap());

    let run2 = store.create_run(owner_id).await.unwrap();
    let record = store
        .upsert_job(run2.id, owner_id, "acme", &listing_entry("acme", "A1", "Staff Engineer"))
        .await
        .unwrap();
    assert_eq!(record.status, JobStatus::Pending);
    assert_eq!(record.run_id, run2.id);
    assert_eq!(record.title, "Staff Engineer");
    assert_eq!(record.fingerprint, Some(fingerprint));
    assert_eq!(record.raw_content_ref.as_deref(), Some("file://raw/a1.html"));

    let expired = store
        .expire_missing(run2.id, owner_id, "acme", &["A1".to_string()])
        .await
        .unwrap();
    assert_eq!(expired, 1);

    let a2 = store
        .get_job(&JobKey::new(owner_id, "acme", "A2"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(a2.status, JobStatus::Expired);

    let counts = store.count_jobs(run2.id).await.unwrap();
    assert_eq!(counts.pending, 1);
    assert_eq!(counts.expired, 1);
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires docker"]
async fn test_finalize_waits_for_pending_records(ctx: &TestHarness) {
    let store = ctx.store();
    let owner_id = create_test_owner(store.as_ref(), &["acme"]).await.unwrap();
    let run = store.create_run(owner_id).await.unwrap();

    store
        .upsert_job(run.id, owner_id, "acme", &listing_entry("acme", "A1", "Engineer"))
        .await
        .unwrap();
    store
        .transition_run(run.id, &[RunStatus::Pending], RunStatus::Ingesting)
        .await
        .unwrap();

    assert!(!store.try_finalize_run(run.id).await.unwrap());

    store
        .complete_job(
            &JobKey::new(owner_id, "acme", "A1"),
            run.id,
            &CrawlOutcome::failed("boom"),
        )
        .await
        .unwrap();

    assert!(store.try_finalize_run(run.id).await.unwrap());
    assert!(!store.try_finalize_run(run.id).await.unwrap());
    let run = store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Finished);
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires docker"]
async fn test_queue_serializes_partitions_and_collapses_duplicates(ctx: &TestHarness) {
    let queue = ctx.queue();

    let first = queue.enqueue(queue_item("acme", "run:acme:A1")).await.unwrap();
    let second = queue.enqueue(queue_item("acme", "run:acme:A2")).await.unwrap();
    let other = queue.enqueue(queue_item("beta", "run:beta:B1")).await.unwrap();
    let duplicate = queue.enqueue(queue_item("acme", "run:acme:A1")).await.unwrap();

    assert!(first.is_created());
    assert!(!duplicate.is_created());
    assert_eq!(duplicate.item_id(), first.item_id());

    // One head per partition
    let claimed = queue.claim("worker-1", 10).await.unwrap();
    let mut ids: Vec<_> = claimed.iter().map(|item| item.id).collect();
    ids.sort();
    let mut expected = vec![first.item_id(), other.item_id()];
    expected.sort();
    assert_eq!(ids, expected);

    // Head still leased: partition is blocked
    assert!(queue.claim("worker-2", 10).await.unwrap().is_empty());

    let head = claimed
        .iter()
        .find(|item| item.id == first.item_id())
        .unwrap();
    assert!(queue.mark_succeeded(head).await.unwrap());
    let claimed = queue.claim("worker-2", 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, second.item_id());
    assert_eq!(claimed[0].attempt, 1);
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires docker"]
async fn test_queue_backoff_and_dead_letter(ctx: &TestHarness) {
    let queue = ctx.queue();
    let item = NewWorkItem::builder()
        .command_type("test:noop")
        .partition_key("acme")
        .dedupe_key("run:acme:A1")
        .payload(serde_json::json!({}))
        .max_attempts(2)
        .build();
    let id = queue.enqueue(item).await.unwrap().item_id();

    let delivery = queue.claim("worker-1", 1).await.unwrap().remove(0);
    let status = queue.mark_failed(&delivery, "first failure").await.unwrap();
    assert_eq!(status, Some(WorkItemStatus::Pending));

    let item = queue.find_by_id(id).await.unwrap();
    assert!(item.next_run_at > chrono::Utc::now() + ChronoDuration::milliseconds(500));
    assert_eq!(item.error_message.as_deref(), Some("first failure"));
    // Backing off
    assert!(queue.claim("worker-1", 1).await.unwrap().is_empty());

    sqlx::query("UPDATE work_items SET next_run_at = NOW() WHERE id = $1")
        .bind(id)
        .execute(&ctx.db_pool)
        .await
        .unwrap();
    let delivery = queue.claim("worker-1", 1).await.unwrap().remove(0);
    let status = queue.mark_failed(&delivery, "second failure").await.unwrap();
    assert_eq!(status, Some(WorkItemStatus::DeadLetter));
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires docker"]
async fn test_queue_ignores_ack_from_lost_lease(ctx: &TestHarness) {
    let queue = PostgresWorkQueue::new(ctx.db_pool.clone()).with_lease_duration(50);
    let head = queue.enqueue(queue_item("acme", "run:acme:A1")).await.unwrap();
    let next = queue.enqueue(queue_item("acme", "run:acme:A2")).await.unwrap();

    let lost = queue.claim("worker-1", 10).await.unwrap().remove(0);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let live = queue.claim("worker-2", 10).await.unwrap().remove(0);
    assert_eq!(live.id, head.item_id());

    assert!(!queue.mark_succeeded(&lost).await.unwrap());
    assert_eq!(queue.mark_failed(&lost, "late").await.unwrap(), None);
    assert!(queue.claim("worker-3", 10).await.unwrap().is_empty());

    assert!(queue.mark_succeeded(&live).await.unwrap());
    let claimed = queue.claim("worker-3", 10).await.unwrap();
    assert_eq!(claimed[0].id, next.item_id());
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires docker"]
async fn test_full_run_on_postgres(ctx: &TestHarness) {
    let store = ctx.dyn_store();
    let queue = ctx.dyn_queue();
    let owner_id = create_test_owner(store.as_ref(), &["acme", "beta"])
        .await
        .unwrap();

    let listings = MockListingFetcher::new()
        .with_listing(
            "acme",
            vec![
                listing_entry("acme", "A1", "Backend Engineer"),
                listing_entry("acme", "A2", "Frontend Engineer"),
            ],
        )
        .with_listing(
            "beta",
            (1..=6)
                .map(|i| listing_entry("beta", &format!("B{}", i), "Engineer"))
                .collect(),
        );

    let pages = MockContentFetcher::new()
        .with_page(page_url("acme", "A1"), "backend engineer rust tokio postgres")
        .with_page(page_url("acme", "A2"), "frontend engineer typescript react css");
    for i in 1..=6 {
        pages.set_failing_url(page_url("beta", &format!("B{}", i)));
    }

    let orchestrator = RunOrchestrator::new(store.clone(), Arc::new(listings), queue.clone());
    let worker = CrawlWorker::new(
        store.clone(),
        Arc::new(pages.clone()),
        Arc::new(MemoryObjectStore::new()),
    )
    .with_config(PipelineConfig::immediate());
    let dispatcher = WorkDispatcher::new(queue, DispatcherConfig::default().concurrency(4))
        .with_handler(Arc::new(worker));

    let run = orchestrator.create_run(owner_id).await.unwrap();
    let status = orchestrator
        .initialize(run.id, StartOptions::default())
        .await
        .unwrap();
    assert_eq!(status, RunStatus::Ingesting);

    dispatcher.run_until_idle().await.unwrap();

    let report = orchestrator.get_run_status(run.id).await.unwrap();
    assert_eq!(report.status, RunStatus::Finished);
    assert_eq!(report.total_jobs, 8);
    assert_eq!(report.counts.ready, 2);
    assert_eq!(report.counts.error, 6);

    let gate = store.run_gate(run.id, "beta").await.unwrap().unwrap();
    assert_eq!(gate.source_failures, FAILURE_THRESHOLD);

    let b6 = store
        .get_job(&JobKey::new(owner_id, "beta", "B6"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(b6.error_message.as_deref(), Some(CIRCUIT_OPEN_MESSAGE));
    assert_eq!(pages.fetch_count(&page_url("beta", "B6")), 0);
}
