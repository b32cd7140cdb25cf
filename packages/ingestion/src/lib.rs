//! Job Posting Ingestion Pipeline
//!
//! Coordinates bulk retrieval of job postings for many owners: builds a job
//! set per run from each source's listing, crawls postings one source at a
//! time, skips content that has not meaningfully changed and streams
//! progress to observers.
//!
//! # Design
//!
//! - Every state change is a guarded write in the store, never a
//!   read-modify-write in memory
//! - Work for one source is strictly serialized by the dispatcher
//! - Crawls are idempotent, so at-least-once delivery is harmless
//! - Job-level failures are written as state; only initialization can fail
//!   a run
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ingestion::{
//!     CrawlWorker, DispatcherConfig, MemoryStore, MemoryWorkQueue, RunOrchestrator,
//!     StartOptions, WorkDispatcher,
//! };
//! use ingestion::testing::{MemoryObjectStore, MockContentFetcher, MockListingFetcher};
//!
//! let store = Arc::new(MemoryStore::new());
//! let queue = Arc::new(MemoryWorkQueue::new());
//!
//! let orchestrator = RunOrchestrator::new(store.clone(), Arc::new(MockListingFetcher::new()), queue.clone());
//! let worker = CrawlWorker::new(store.clone(), Arc::new(MockContentFetcher::new()), Arc::new(MemoryObjectStore::new()));
//! let dispatcher = WorkDispatcher::new(queue, DispatcherConfig::default()).with_handler(Arc::new(worker));
//!
//! let run_id = orchestrator.start(owner_id, StartOptions::default()).await?;
//! dispatcher.run_until_idle().await?;
//! let report = orchestrator.get_run_status(run_id).await?;
//! ```
//!
//! # Modules
//!
//! - [`types`] - Runs, job records, source settings
//! - [`fingerprint`] - SimHash content fingerprints
//! - [`circuit`] - Per-source failure threshold
//! - [`traits`] - Store and collaborator abstractions
//! - [`stores`] - Storage implementations (MemoryStore, PostgresStore)
//! - [`dispatch`] - Partitioned, deduplicating work queue and dispatcher
//! - [`pipeline`] - Orchestrator, crawl worker, progress streamer
//! - [`adapters`] - HTTP fetchers and filesystem object store
//! - [`testing`] - Mock collaborators for testing

pub mod adapters;
pub mod circuit;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fingerprint;
pub mod pipeline;
pub mod stores;
pub mod testing;
pub mod traits;
pub mod types;

// Re-export core types at crate root
pub use config::PipelineConfig;
pub use error::{
    FetchError, IngestionError, ObjectStoreError, QueueError, Result, StoreError,
};
pub use fingerprint::{hamming_distance, is_similar, Fingerprint, SIMILARITY_THRESHOLD};
pub use traits::{
    ContentFetcher, IngestionStore, JobRecordStore, ListingFetcher, ObjectStore, RunStore,
    SourceSettingsStore,
};
pub use types::{
    CrawlOutcome, IngestionRun, JobCounts, JobKey, JobProgress, JobRecord, JobStatus,
    ListingEntry, RunStatus, RunStatusReport, SourceSetting, TitleFilters,
};

// Pipeline
pub use pipeline::{
    CrawlCommand, CrawlDisposition, CrawlWorker, ProgressEvent, ProgressStreamer,
    RunOrchestrator, StartOptions,
};

// Dispatch
pub use dispatch::{
    DispatcherConfig, EnqueueResult, MemoryWorkQueue, WorkDispatcher, WorkHandler, WorkQueue,
};

#[cfg(feature = "postgres")]
pub use dispatch::PostgresWorkQueue;

// Storage backends
pub use stores::MemoryStore;

#[cfg(feature = "postgres")]
pub use stores::PostgresStore;

pub use adapters::{FsObjectStore, HttpContentFetcher, HttpListingFetcher};
