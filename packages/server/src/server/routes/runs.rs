//! Run lifecycle endpoints.
//!
//! POST /api/ingestion/runs
//! GET  /api/ingestion/runs/:run_id/status
//! POST /api/ingestion/runs/:run_id/abort

use axum::{
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    Json,
};
use ingestion::{RunStatus, RunStatusReport, StartOptions};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::error_status;
use crate::auth::{authenticate, authorize_owner};
use crate::server::app::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateRunResponse {
    pub run_id: Uuid,
    pub status: RunStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AbortRunResponse {
    pub run_id: Uuid,
    pub aborted: bool,
}

/// Start a run for the token's owner.
///
/// The body is optional; `{"force": true}` stores every fetched page
/// regardless of similarity.
pub async fn create_run_handler(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    body: Option<Json<StartOptions>>,
) -> Result<(StatusCode, Json<CreateRunResponse>), StatusCode> {
    let claims = authenticate(&state.jwt_service, None, &headers)?;
    let options = body.map(|Json(options)| options).unwrap_or_default();

    let run_id = state
        .orchestrator
        .start(claims.owner_id, options)
        .await
        .map_err(error_status)?;

    info!(run_id = %run_id, owner_id = %claims.owner_id, force = options.force, "run requested");

    Ok((
        StatusCode::CREATED,
        Json(CreateRunResponse {
            run_id,
            status: RunStatus::Pending,
        }),
    ))
}

pub async fn run_status_handler(
    Extension(state): Extension<AppState>,
    Path(run_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<RunStatusReport>, StatusCode> {
    let report = load_owned_run(&state, run_id, None, &headers).await?;
    Ok(Json(report))
}

pub async fn abort_run_handler(
    Extension(state): Extension<AppState>,
    Path(run_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<AbortRunResponse>, StatusCode> {
    load_owned_run(&state, run_id, None, &headers).await?;

    let aborted = state.orchestrator.abort(run_id).await.map_err(error_status)?;
    Ok(Json(AbortRunResponse { run_id, aborted }))
}

/// Authenticate the caller and check they own the run.
///
/// 401 without a valid token, 404 for an unknown run, 403 for another
/// owner's run.
pub(crate) async fn load_owned_run(
    state: &AppState,
    run_id: Uuid,
    token: Option<String>,
    headers: &HeaderMap,
) -> Result<RunStatusReport, StatusCode> {
    let claims = authenticate(&state.jwt_service, token, headers)?;

    let report = state
        .orchestrator
        .get_run_status(run_id)
        .await
        .map_err(error_status)?;

    authorize_owner(&claims, report.owner_id)?;
    Ok(report)
}
