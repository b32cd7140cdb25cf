//! Test harness with testcontainers for integration testing.
//!
//! One Postgres container is shared by all tests and started on first use.
//! Each harness gets its own freshly migrated database: the work queue is
//! global to a database, so tests sharing one would claim each other's items.

use std::sync::Arc;

use anyhow::{Context, Result};
use ingestion::{IngestionStore, PostgresStore, PostgresWorkQueue, WorkQueue};
use sqlx::PgPool;
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

/// Shared test infrastructure that persists across all tests.
struct SharedTestInfra {
    host: String,
    port: u16,
    admin_pool: PgPool,
    // Keep container alive for the entire test run
    _postgres: ContainerAsync<Postgres>,
}

/// Global shared infrastructure - initialized once, reused by all tests.
static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        // Run tests with: RUST_LOG=debug cargo test -- --ignored --nocapture
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .with_tag("16")
            .with_cmd(["-c", "max_connections=200"])
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let host = postgres.get_host().await?.to_string();
        let port = postgres.get_host_port_ipv4(5432).await?;

        let admin_pool = PgPool::connect(&database_url(&host, port, "postgres"))
            .await
            .context("Failed to connect to Postgres")?;

        Ok(Self {
            host,
            port,
            admin_pool,
            _postgres: postgres,
        })
    }

    pub(super) async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared test infrastructure")
            })
            .await
    }
}

fn database_url(host: &str, port: u16, database: &str) -> String {
    format!(
        "postgresql://postgres:postgres@{}:{}/{}",
        host, port, database
    )
}

/// Test harness over a private, migrated database.
///
/// ```ignore
/// use test_context::test_context;
///
/// #[test_context(TestHarness)]
/// #[tokio::test]
/// #[ignore = "requires docker"]
/// async fn my_test(ctx: &TestHarness) {
///     let store = ctx.store();
///     // ... test code
/// }
/// ```
pub struct TestHarness {
    /// Database pool - use this for test fixtures.
    pub db_pool: PgPool,
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new().await.expect("Failed to create test harness")
    }

    async fn teardown(self) {
        self.db_pool.close().await;
    }
}

impl TestHarness {
    pub async fn new() -> Result<Self> {
        let infra = SharedTestInfra::get().await;

        let database = format!("ingestion_{}", Uuid::new_v4().simple());
        sqlx::query(&format!("CREATE DATABASE {}", database))
            .execute(&infra.admin_pool)
            .await
            .context("Failed to create test database")?;

        let db_pool = PgPool::connect(&database_url(&infra.host, infra.port, &database))
            .await
            .context("Failed to connect to test database")?;

        sqlx::migrate!("./migrations")
            .run(&db_pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self { db_pool })
    }

    pub fn store(&self) -> Arc<PostgresStore> {
        Arc::new(PostgresStore::new(self.db_pool.clone()))
    }

    pub fn dyn_store(&self) -> Arc<dyn IngestionStore> {
        self.store()
    }

    pub fn queue(&self) -> Arc<PostgresWorkQueue> {
        Arc::new(PostgresWorkQueue::new(self.db_pool.clone()))
    }

    pub fn dyn_queue(&self) -> Arc<dyn WorkQueue> {
        self.queue()
    }
}
