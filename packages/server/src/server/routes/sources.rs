//! Per-owner source settings.
//!
//! GET    /api/ingestion/sources
//! PUT    /api/ingestion/sources/:source
//! DELETE /api/ingestion/sources/:source

use axum::{
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    Json,
};
use ingestion::{IngestionError, SourceSetting, SourceSettingsStore, TitleFilters};
use serde::Deserialize;
use tracing::info;

use super::error_status;
use crate::auth::authenticate;
use crate::server::app::AppState;

#[derive(Debug, Deserialize)]
pub struct UpsertSourceRequest {
    #[serde(default)]
    pub title_filters: TitleFilters,
    #[serde(default = "default_enabled")]
    pub is_enabled: bool,
}

fn default_enabled() -> bool {
    true
}

pub async fn list_sources_handler(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<SourceSetting>>, StatusCode> {
    let claims = authenticate(&state.jwt_service, None, &headers)?;

    let sources = state
        .store
        .list_sources(claims.owner_id)
        .await
        .map_err(|e| error_status(IngestionError::from(e)))?;
    Ok(Json(sources))
}

pub async fn upsert_source_handler(
    Extension(state): Extension<AppState>,
    Path(source): Path<String>,
    headers: HeaderMap,
    Json(request): Json<UpsertSourceRequest>,
) -> Result<Json<SourceSetting>, StatusCode> {
    let claims = authenticate(&state.jwt_service, None, &headers)?;

    let source = source.trim();
    if source.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let mut setting =
        SourceSetting::enabled(claims.owner_id, source).with_filters(request.title_filters);
    if !request.is_enabled {
        setting = setting.disabled();
    }

    let saved = state
        .store
        .upsert_source(&setting)
        .await
        .map_err(|e| error_status(IngestionError::from(e)))?;

    info!(owner_id = %claims.owner_id, source = %saved.source, enabled = saved.is_enabled, "source settings saved");
    Ok(Json(saved))
}

pub async fn delete_source_handler(
    Extension(state): Extension<AppState>,
    Path(source): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, StatusCode> {
    let claims = authenticate(&state.jwt_service, None, &headers)?;

    let deleted = state
        .store
        .delete_source(claims.owner_id, &source)
        .await
        .map_err(|e| error_status(IngestionError::from(e)))?;

    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}
