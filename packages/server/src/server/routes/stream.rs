//! SSE progress endpoint.
//!
//! GET /api/ingestion/runs/:run_id/stream?token=JWT
//!
//! Auth: `EventSource` cannot send custom headers, so the capability token
//! is passed as a `?token=` query param, falling back to the Authorization
//! header for other clients.
//!
//! Events: `status`, `all_jobs` once ingestion begins, then `update` diffs.
//! The stream closes after the terminal `status` event.

use std::convert::Infallible;

use axum::{
    extract::{Extension, Path, Query},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use super::runs::load_owned_run;
use crate::server::app::AppState;

#[derive(Deserialize)]
pub struct StreamQuery {
    /// Capability token for authentication
    token: Option<String>,
}

pub async fn stream_handler(
    Extension(state): Extension<AppState>,
    Path(run_id): Path<Uuid>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    load_owned_run(&state, run_id, query.token, &headers).await?;

    let events = state.streamer.subscribe(run_id).filter_map(move |result| async move {
        match result {
            Ok(event) => Event::default()
                .event(event.name())
                .json_data(event.data())
                .ok()
                .map(Ok),
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "progress stream failed");
                Event::default()
                    .event("error")
                    .json_data(serde_json::json!({ "error": e.to_string() }))
                    .ok()
                    .map(Ok)
            }
        }
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
