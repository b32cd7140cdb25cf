//! PostgreSQL storage implementation.
//!
//! Tables (see the server's migrations):
//! - `ingestion_runs` with the per-source failure map in a JSONB `metadata` column
//! - `job_records`, unique on `(owner_id, source, external_id)`
//! - `source_settings`, keyed by `(owner_id, source)`
//!
//! Every transition is a single guarded `UPDATE`, so concurrent workers never
//! lose writes and redelivered work is a no-op.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use sqlx::FromRow;
use tracing::debug;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::fingerprint::Fingerprint;
use crate::traits::store::{JobRecordStore, RunStore, SourceSettingsStore};
use crate::types::{
    truncate_message, CrawlOutcome, IngestionRun, InitializationSummary, JobCounts, JobKey,
    JobProgress, JobRecord, JobStatus, ListingEntry, RunGate, RunStatus, SourceSetting,
    TitleFilters,
};

// ============================================================================
// Row Types
// ============================================================================

#[derive(FromRow)]
struct RunRow {
    id: Uuid,
    owner_id: Uuid,
    status: RunStatus,
    error_message: Option<String>,
    metadata: Json<HashMap<String, i64>>,
    total_jobs: i64,
    jobs_expired: i64,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl From<RunRow> for IngestionRun {
    fn from(row: RunRow) -> Self {
        Self {
            id: row.id,
            owner_id: row.owner_id,
            status: row.status,
            error_message: row.error_message,
            metadata: row.metadata.0,
            total_jobs: row.total_jobs,
            jobs_expired: row.jobs_expired,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct JobRow {
    id: Uuid,
    owner_id: Uuid,
    source: String,
    external_id: String,
    run_id: Uuid,
    url: String,
    title: String,
    location: Option<String>,
    status: JobStatus,
    fingerprint: Option<i64>,
    raw_content_ref: Option<String>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<JobRow> for JobRecord {
    fn from(row: JobRow) -> Self {
        Self {
            id: row.id,
            owner_id: row.owner_id,
            source: row.source,
            external_id: row.external_id,
            run_id: row.run_id,
            url: row.url,
            title: row.title,
            location: row.location,
            status: row.status,
            fingerprint: row.fingerprint.map(Fingerprint::from_i64),
            raw_content_ref: row.raw_content_ref,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct SettingRow {
    owner_id: Uuid,
    source: String,
    title_filters: Json<TitleFilters>,
    is_enabled: bool,
}

impl From<SettingRow> for SourceSetting {
    fn from(row: SettingRow) -> Self {
        Self {
            owner_id: row.owner_id,
            source: row.source,
            title_filters: row.title_filters.0,
            is_enabled: row.is_enabled,
        }
    }
}

// ============================================================================
// Store
// ============================================================================

/// PostgreSQL-backed store for runs, job records and source settings.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a store from an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RunStore for PostgresStore {
    async fn create_run(&self, owner_id: Uuid) -> StoreResult<IngestionRun> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            INSERT INTO ingestion_runs (id, owner_id, status, metadata, created_at, updated_at)
            VALUES ($1, $2, 'pending', '{}'::jsonb, NOW(), NOW())
            RETURNING id, owner_id, status, error_message, metadata, total_jobs, jobs_expired,
                      created_at, started_at, finished_at, updated_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(owner_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<IngestionRun>> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, owner_id, status, error_message, metadata, total_jobs, jobs_expired,
                   created_at, started_at, finished_at, updated_at
            FROM ingestion_runs
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn unfinished_runs(&self) -> StoreResult<Vec<IngestionRun>> {
        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, owner_id, status, error_message, metadata, total_jobs, jobs_expired,
                   created_at, started_at, finished_at, updated_at
            FROM ingestion_runs
            WHERE status IN ('pending', 'initializing', 'ingesting')
            ORDER BY created_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn transition_run(
        &self,
        run_id: Uuid,
        from: &[RunStatus],
        to: RunStatus,
    ) -> StoreResult<bool> {
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();

        let result = sqlx::query(
            r#"
            UPDATE ingestion_runs
            SET status = $2,
                started_at = CASE WHEN $4 THEN COALESCE(started_at, NOW()) ELSE started_at END,
                finished_at = CASE WHEN $5 THEN NOW() ELSE finished_at END,
                updated_at = NOW()
            WHERE id = $1
              AND status::text = ANY($3)
            "#,
        )
        .bind(run_id)
        .bind(to)
        .bind(&from)
        .bind(to == RunStatus::Initializing)
        .bind(to.is_terminal())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn fail_run(&self, run_id: Uuid, message: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_runs
            SET status = 'error',
                error_message = $2,
                finished_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
              AND status IN ('pending', 'initializing')
            "#,
        )
        .bind(run_id)
        .bind(truncate_message(message))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_initialization(
        &self,
        run_id: Uuid,
        summary: InitializationSummary,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_runs
            SET total_jobs = $2,
                jobs_expired = $3,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(summary.total_jobs)
        .bind(summary.jobs_expired)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RunNotFound(run_id));
        }
        Ok(())
    }

    async fn run_gate(&self, run_id: Uuid, source: &str) -> StoreResult<Option<RunGate>> {
        let row = sqlx::query_as::<_, (RunStatus, i64)>(
            r#"
            SELECT status, COALESCE((metadata ->> $2)::bigint, 0)
            FROM ingestion_runs
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(source)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(status, source_failures)| RunGate {
            status,
            source_failures,
        }))
    }

    async fn increment_source_failures(&self, run_id: Uuid, source: &str) -> StoreResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE ingestion_runs
            SET metadata = jsonb_set(
                    metadata,
                    ARRAY[$2::text],
                    to_jsonb(COALESCE((metadata ->> $2)::bigint, 0) + 1),
                    true
                ),
                updated_at = NOW()
            WHERE id = $1
            RETURNING (metadata ->> $2)::bigint
            "#,
        )
        .bind(run_id)
        .bind(source)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::RunNotFound(run_id))?;

        debug!(run_id = %run_id, source = %source, failures = count, "source failure recorded");
        Ok(count)
    }

    async fn try_finalize_run(&self, run_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_runs r
            SET status = 'finished',
                finished_at = NOW(),
                updated_at = NOW()
            WHERE r.id = $1
              AND r.status = 'ingesting'
              AND NOT EXISTS (
                  SELECT 1 FROM job_records j
                  WHERE j.run_id = r.id AND j.status = 'pending'
              )
            "#,
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl JobRecordStore for PostgresStore {
    async fn upsert_job(
        &self,
        run_id: Uuid,
        owner_id: Uuid,
        source: &str,
        entry: &ListingEntry,
    ) -> StoreResult<JobRecord> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO job_records (
                id, owner_id, source, external_id, run_id, url, title, location,
                status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending', NOW(), NOW())
            ON CONFLICT (owner_id, source, external_id) DO UPDATE
            SET run_id = EXCLUDED.run_id,
                url = EXCLUDED.url,
                title = EXCLUDED.title,
                location = EXCLUDED.location,
                status = 'pending',
                error_message = NULL,
                updated_at = NOW()
            RETURNING id, owner_id, source, external_id, run_id, url, title, location, status,
                      fingerprint, raw_content_ref, error_message, created_at, updated_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(owner_id)
        .bind(source)
        .bind(&entry.external_id)
        .bind(run_id)
        .bind(&entry.url)
        .bind(&entry.title)
        .bind(&entry.location)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn expire_missing(
        &self,
        run_id: Uuid,
        owner_id: Uuid,
        source: &str,
        current_ids: &[String],
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE job_records
            SET status = 'expired',
                run_id = $1,
                updated_at = NOW()
            WHERE owner_id = $2
              AND source = $3
              AND status <> 'expired'
              AND NOT (external_id = ANY($4))
            "#,
        )
        .bind(run_id)
        .bind(owner_id)
        .bind(source)
        .bind(current_ids)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn get_job(&self, key: &JobKey) -> StoreResult<Option<JobRecord>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, owner_id, source, external_id, run_id, url, title, location, status,
                   fingerprint, raw_content_ref, error_message, created_at, updated_at
            FROM job_records
            WHERE owner_id = $1 AND source = $2 AND external_id = $3
            "#,
        )
        .bind(key.owner_id)
        .bind(&key.source)
        .bind(&key.external_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn pending_jobs(&self, run_id: Uuid) -> StoreResult<Vec<JobRecord>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, owner_id, source, external_id, run_id, url, title, location, status,
                   fingerprint, raw_content_ref, error_message, created_at, updated_at
            FROM job_records
            WHERE run_id = $1 AND status = 'pending'
            ORDER BY source, created_at, external_id
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn job_progress(&self, run_id: Uuid) -> StoreResult<Vec<JobProgress>> {
        let rows = sqlx::query_as::<_, (String, String, String, JobStatus)>(
            r#"
            SELECT source, external_id, title, status
            FROM job_records
            WHERE run_id = $1
            ORDER BY source, external_id
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(source, external_id, title, status)| JobProgress {
                source,
                external_id,
                title,
                status,
            })
            .collect())
    }

    async fn count_jobs(&self, run_id: Uuid) -> StoreResult<JobCounts> {
        let rows = sqlx::query_as::<_, (JobStatus, i64)>(
            r#"
            SELECT status, COUNT(*)
            FROM job_records
            WHERE run_id = $1
            GROUP BY status
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = JobCounts::default();
        for (status, count) in rows {
            counts.add(status, count);
        }
        Ok(counts)
    }

    async fn complete_job(
        &self,
        key: &JobKey,
        run_id: Uuid,
        outcome: &CrawlOutcome,
    ) -> StoreResult<bool> {
        let result = match outcome {
            CrawlOutcome::Ready {
                fingerprint,
                raw_content_ref,
            } => {
                sqlx::query(
                    r#"
                    UPDATE job_records
                    SET status = 'ready',
                        fingerprint = $5,
                        raw_content_ref = $6,
                        error_message = NULL,
                        updated_at = NOW()
                    WHERE owner_id = $1 AND source = $2 AND external_id = $3
                      AND run_id = $4 AND status = 'pending'
                    "#,
                )
                .bind(key.owner_id)
                .bind(&key.source)
                .bind(&key.external_id)
                .bind(run_id)
                .bind(fingerprint.to_i64())
                .bind(raw_content_ref)
                .execute(&self.pool)
                .await?
            }
            CrawlOutcome::Skipped => {
                sqlx::query(
                    r#"
                    UPDATE job_records
                    SET status = 'skipped',
                        error_message = NULL,
                        updated_at = NOW()
                    WHERE owner_id = $1 AND source = $2 AND external_id = $3
                      AND run_id = $4 AND status = 'pending'
                    "#,
                )
                .bind(key.owner_id)
                .bind(&key.source)
                .bind(&key.external_id)
                .bind(run_id)
                .execute(&self.pool)
                .await?
            }
            CrawlOutcome::Failed { message } => {
                sqlx::query(
                    r#"
                    UPDATE job_records
                    SET status = 'error',
                        error_message = $5,
                        updated_at = NOW()
                    WHERE owner_id = $1 AND source = $2 AND external_id = $3
                      AND run_id = $4 AND status = 'pending'
                    "#,
                )
                .bind(key.owner_id)
                .bind(&key.source)
                .bind(&key.external_id)
                .bind(run_id)
                .bind(message)
                .execute(&self.pool)
                .await?
            }
        };

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl SourceSettingsStore for PostgresStore {
    async fn enabled_sources(&self, owner_id: Uuid) -> StoreResult<Vec<SourceSetting>> {
        let rows = sqlx::query_as::<_, SettingRow>(
            r#"
            SELECT owner_id, source, title_filters, is_enabled
            FROM source_settings
            WHERE owner_id = $1 AND is_enabled = true
            ORDER BY source
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn list_sources(&self, owner_id: Uuid) -> StoreResult<Vec<SourceSetting>> {
        let rows = sqlx::query_as::<_, SettingRow>(
            r#"
            SELECT owner_id, source, title_filters, is_enabled
            FROM source_settings
            WHERE owner_id = $1
            ORDER BY source
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn upsert_source(&self, setting: &SourceSetting) -> StoreResult<SourceSetting> {
        let row = sqlx::query_as::<_, SettingRow>(
            r#"
            INSERT INTO source_settings (owner_id, source, title_filters, is_enabled, created_at, updated_at)
            VALUES ($1, $2, $3, $4, NOW(), NOW())
            ON CONFLICT (owner_id, source) DO UPDATE
            SET title_filters = EXCLUDED.title_filters,
                is_enabled = EXCLUDED.is_enabled,
                updated_at = NOW()
            RETURNING owner_id, source, title_filters, is_enabled
            "#,
        )
        .bind(setting.owner_id)
        .bind(&setting.source)
        .bind(Json(&setting.title_filters))
        .bind(setting.is_enabled)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn delete_source(&self, owner_id: Uuid, source: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM source_settings
            WHERE owner_id = $1 AND source = $2
            "#,
        )
        .bind(owner_id)
        .bind(source)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
