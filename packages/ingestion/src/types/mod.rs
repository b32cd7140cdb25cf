//! Domain types for runs, job records and source settings.

pub mod job;
pub mod run;
pub mod settings;

pub use job::{
    truncate_message, CrawlOutcome, JobKey, JobProgress, JobRecord, JobStatus, ListingEntry,
    MAX_ERROR_MESSAGE_LEN,
};
pub use run::{
    IngestionRun, InitializationSummary, JobCounts, RunGate, RunStatus, RunStatusReport,
};
pub use settings::{SourceSetting, TitleFilters};
