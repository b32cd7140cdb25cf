// Main entry point for API server

use anyhow::{Context, Result};
use server_core::{server::build_app, Config};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug,ingestion=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting job ingestion API");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    // Connect to database
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    tokio::fs::create_dir_all(&config.raw_content_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.raw_content_dir))?;

    // Build application
    let (app, dispatcher, orchestrator) = build_app(pool, &config);

    // Crawl dispatcher runs beside the HTTP server and drains on shutdown
    let shutdown = CancellationToken::new();
    let dispatcher_handle = tokio::spawn(dispatcher.run(shutdown.clone()));
    tracing::info!(
        concurrency = config.dispatch_concurrency,
        "Crawl dispatcher started"
    );

    // Runs interrupted by a previous shutdown or crash pick up where they left off
    tokio::spawn(async move {
        match orchestrator.resume_unfinished().await {
            Ok(0) => {}
            Ok(count) => tracing::info!(count, "Unfinished ingestion runs resumed"),
            Err(e) => tracing::error!(error = %e, "Failed to resume unfinished ingestion runs"),
        }
    });

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    let server_shutdown = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutdown signal received");
        server_shutdown.cancel();
    })
    .await
    .context("Server error")?;

    shutdown.cancel();
    dispatcher_handle
        .await
        .context("Crawl dispatcher panicked")?;
    tracing::info!("Shutdown complete");

    Ok(())
}
