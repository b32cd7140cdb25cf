use axum::{extract::Extension, http::StatusCode, Json};
use serde::Serialize;

use crate::server::app::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    database: DatabaseHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    connection_pool: Option<ConnectionPoolHealth>,
}

#[derive(Serialize)]
pub struct DatabaseHealth {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
pub struct ConnectionPoolHealth {
    size: u32,
    idle_connections: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_connections: Option<u32>,
}

/// Health check endpoint
///
/// Checks database connectivity and reports connection pool utilization.
/// Returns 200 OK if the database answers, 503 Service Unavailable otherwise.
/// Without a database pool (in-memory store) the check is skipped.
pub async fn health_handler(
    Extension(state): Extension<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    let Some(pool) = state.db_pool.as_ref() else {
        return (
            StatusCode::OK,
            Json(HealthResponse {
                status: "healthy".to_string(),
                database: DatabaseHealth {
                    status: "not_configured".to_string(),
                    error: None,
                },
                connection_pool: None,
            }),
        );
    };

    let db_health = match tokio::time::timeout(
        std::time::Duration::from_secs(5),
        sqlx::query("SELECT 1").execute(pool),
    )
    .await
    {
        Ok(Ok(_)) => DatabaseHealth {
            status: "ok".to_string(),
            error: None,
        },
        Ok(Err(e)) => DatabaseHealth {
            status: "error".to_string(),
            error: Some(format!("Query failed: {}", e)),
        },
        Err(_) => DatabaseHealth {
            status: "error".to_string(),
            error: Some("Query timeout (>5s)".to_string()),
        },
    };

    let pool_health = ConnectionPoolHealth {
        size: pool.size(),
        idle_connections: pool.num_idle(),
        max_connections: Some(pool.options().get_max_connections()),
    };

    let is_healthy = db_health.status == "ok";

    let overall_status = if is_healthy { "healthy" } else { "unhealthy" };
    let status_code = if is_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(HealthResponse {
            status: overall_status.to_string(),
            database: db_health,
            connection_pool: Some(pool_health),
        }),
    )
}
