//! The ingestion pipeline: orchestration, crawling and progress reporting.

pub mod crawler;
pub mod orchestrator;
pub mod progress;

pub use crawler::{raw_content_key, CrawlCommand, CrawlDisposition, CrawlWorker, CRAWL_COMMAND_TYPE};
pub use orchestrator::{RunOrchestrator, StartOptions};
pub use progress::{JobSnapshot, ProgressEvent, ProgressStreamer, ProgressTracker};
