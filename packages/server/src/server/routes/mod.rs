// HTTP routes
pub mod health;
pub mod runs;
pub mod sources;
pub mod stream;

pub use health::*;
pub use runs::*;
pub use sources::*;
pub use stream::*;

use axum::http::StatusCode;
use ingestion::{IngestionError, StoreError};
use tracing::error;

/// Map a pipeline error to a response status, logging server-side failures.
pub(crate) fn error_status(err: IngestionError) -> StatusCode {
    match err {
        IngestionError::RunNotFound(_) | IngestionError::Store(StoreError::RunNotFound(_)) => {
            StatusCode::NOT_FOUND
        }
        other => {
            error!(error = %other, "ingestion request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
