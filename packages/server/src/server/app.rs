//! Application setup and server configuration.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::Extension,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderValue, Method,
    },
    routing::{get, post, put},
    Router,
};
use ingestion::{
    CrawlWorker, DispatcherConfig, FsObjectStore, HttpContentFetcher, HttpListingFetcher,
    IngestionStore, ListingFetcher, PostgresStore, PostgresWorkQueue, ProgressStreamer,
    RunOrchestrator, WorkDispatcher, WorkQueue,
};
use sqlx::PgPool;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::auth::JwtService;
use crate::config::Config;
use crate::server::routes::{
    abort_run_handler, create_run_handler, delete_source_handler, health_handler,
    list_sources_handler, run_status_handler, stream_handler, upsert_source_handler,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn IngestionStore>,
    pub orchestrator: RunOrchestrator,
    pub streamer: Arc<ProgressStreamer>,
    pub jwt_service: Arc<JwtService>,
    /// Present when backed by PostgreSQL; reported by the health check
    pub db_pool: Option<PgPool>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn IngestionStore>,
        listings: Arc<dyn ListingFetcher>,
        queue: Arc<dyn WorkQueue>,
        jwt_service: JwtService,
        stream_poll_interval: Duration,
    ) -> Self {
        Self {
            orchestrator: RunOrchestrator::new(store.clone(), listings, queue),
            streamer: Arc::new(ProgressStreamer::new(store.clone(), stream_poll_interval)),
            store,
            jwt_service: Arc::new(jwt_service),
            db_pool: None,
        }
    }

    pub fn with_pool(mut self, pool: PgPool) -> Self {
        self.db_pool = Some(pool);
        self
    }
}

/// Build the Axum application router
pub fn build_router(state: AppState, allowed_origins: &[String]) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(allow_origin(allowed_origins))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]);

    Router::new()
        .route("/api/ingestion/runs", post(create_run_handler))
        .route("/api/ingestion/runs/:run_id/status", get(run_status_handler))
        .route("/api/ingestion/runs/:run_id/abort", post(abort_run_handler))
        .route("/api/ingestion/runs/:run_id/stream", get(stream_handler))
        .route("/api/ingestion/sources", get(list_sources_handler))
        .route(
            "/api/ingestion/sources/:source",
            put(upsert_source_handler).delete(delete_source_handler),
        )
        .route("/health", get(health_handler))
        // Middleware layers (applied in reverse order - last added runs first)
        .layer(Extension(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// No configured origins means any origin (development).
fn allow_origin(allowed_origins: &[String]) -> AllowOrigin {
    if allowed_origins.is_empty() {
        return AllowOrigin::from(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    AllowOrigin::list(origins)
}

/// Wire the PostgreSQL-backed pipeline.
///
/// Returns the router, the dispatcher that executes crawl work and the
/// orchestrator shared with the routes; the caller runs the first two and
/// resumes unfinished runs through the third.
pub fn build_app(pool: PgPool, config: &Config) -> (Router, WorkDispatcher, RunOrchestrator) {
    let pipeline = config.pipeline();

    let store: Arc<dyn IngestionStore> = Arc::new(PostgresStore::new(pool.clone()));
    let queue: Arc<dyn WorkQueue> = Arc::new(
        PostgresWorkQueue::new(pool.clone()).with_dedupe_window(config.dedupe_window_secs),
    );
    let listings = Arc::new(HttpListingFetcher::new(config.listing_base_url.clone()));

    let worker = CrawlWorker::new(
        store.clone(),
        Arc::new(HttpContentFetcher::new()),
        Arc::new(FsObjectStore::new(config.raw_content_dir.clone())),
    )
    .with_config(pipeline.clone());

    let dispatcher = WorkDispatcher::new(
        queue.clone(),
        DispatcherConfig::default()
            .concurrency(config.dispatch_concurrency)
            .poll_interval(config.dispatch_poll_interval),
    )
    .with_handler(Arc::new(worker));

    let state = AppState::new(
        store,
        listings,
        queue,
        JwtService::new(&config.jwt_secret, config.jwt_issuer.clone()),
        pipeline.stream_poll_interval,
    )
    .with_pool(pool);
    let orchestrator = state.orchestrator.clone();

    (
        build_router(state, &config.allowed_origins),
        dispatcher,
        orchestrator,
    )
}
