//! Typed errors for the ingestion library.
//!
//! Uses `thiserror` for library errors (not `anyhow`) to provide
//! strongly-typed, composable error handling.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the run orchestrator and other top-level operations.
#[derive(Debug, Error)]
pub enum IngestionError {
    /// Run or job record storage failed
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Work dispatcher failed
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// No run with this id exists
    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from the run, job record and source settings stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database query failed
    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Run does not exist
    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    /// Backend cannot be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Errors from the listing and content fetch collaborators.
///
/// The crawl worker treats every variant as retryable.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Transport-level failure (connection refused, TLS, body read)
    #[error("HTTP error: {0}")]
    Http(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Non-2xx response
    #[error("HTTP {status} fetching {url}")]
    Status { url: String, status: u16 },

    /// Request exceeded the client timeout
    #[error("timeout fetching: {url}")]
    Timeout { url: String },

    /// Listing response could not be decoded
    #[error("invalid listing payload: {0}")]
    InvalidPayload(String),
}

/// Errors from the raw content object store.
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    /// Filesystem write failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other backend failure
    #[error("object store error: {0}")]
    Backend(String),
}

/// Errors from the ordered work dispatcher.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Database query failed
    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Work item does not exist
    #[error("work item not found: {0}")]
    NotFound(Uuid),

    /// Payload could not be (de)serialized
    #[error("invalid payload for {command_type}: {reason}")]
    InvalidPayload { command_type: String, reason: String },
}

/// Result type alias for top-level ingestion operations.
pub type Result<T> = std::result::Result<T, IngestionError>;

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type alias for fetch operations.
pub type FetchResult<T> = std::result::Result<T, FetchError>;

/// Result type alias for dispatcher operations.
pub type QueueResult<T> = std::result::Result<T, QueueError>;
