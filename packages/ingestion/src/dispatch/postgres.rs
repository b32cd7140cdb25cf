//! PostgreSQL-backed ordered work queue.
//!
//! - Claiming takes the oldest open item of each partition and skips
//!   partitions whose head is still leased, using `FOR UPDATE SKIP LOCKED`
//!   so any number of dispatchers can poll concurrently.
//! - Enqueue deduplication runs under a transaction-scoped advisory lock on
//!   the dedupe key, so concurrent enqueues of the same key collapse.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use super::queue::{
    EnqueueResult, NewWorkItem, WorkItem, WorkItemStatus, WorkQueue, DEFAULT_DEDUPE_WINDOW_SECS,
    DEFAULT_LEASE_MS,
};
use crate::error::{QueueError, QueueResult};

/// PostgreSQL-backed work queue implementation.
#[derive(Clone)]
pub struct PostgresWorkQueue {
    pool: PgPool,
    lease_ms: i64,
    dedupe_window_secs: i64,
}

impl PostgresWorkQueue {
    /// Create a new PostgreSQL work queue.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lease_ms: DEFAULT_LEASE_MS,
            dedupe_window_secs: DEFAULT_DEDUPE_WINDOW_SECS,
        }
    }

    /// Create with a custom lease duration.
    pub fn with_lease_duration(mut self, lease_ms: i64) -> Self {
        self.lease_ms = lease_ms;
        self
    }

    pub fn with_dedupe_window(mut self, secs: i64) -> Self {
        self.dedupe_window_secs = secs;
        self
    }

    /// Look up an item by id.
    pub async fn find_by_id(&self, item_id: Uuid) -> QueueResult<WorkItem> {
        sqlx::query_as::<_, WorkItem>(
            r#"
            SELECT id, command_type, partition_key, dedupe_key, payload, status, attempt,
                   max_attempts, worker_id, lease_expires_at, next_run_at, error_message,
                   created_at, updated_at
            FROM work_items
            WHERE id = $1
            "#,
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(QueueError::NotFound(item_id))
    }
}

#[async_trait]
impl WorkQueue for PostgresWorkQueue {
    async fn enqueue(&self, item: NewWorkItem) -> QueueResult<EnqueueResult> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&item.dedupe_key)
            .execute(&mut *tx)
            .await?;

        let existing = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id
            FROM work_items
            WHERE dedupe_key = $1
              AND status <> 'dead_letter'
              AND created_at > NOW() - ($2 || ' seconds')::INTERVAL
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(&item.dedupe_key)
        .bind(self.dedupe_window_secs.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(existing) = existing {
            tx.commit().await?;
            debug!(dedupe_key = %item.dedupe_key, item_id = %existing, "duplicate enqueue collapsed");
            return Ok(EnqueueResult::Duplicate(existing));
        }

        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO work_items (
                id, command_type, partition_key, dedupe_key, payload, status,
                attempt, max_attempts, next_run_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6, NOW(), NOW(), NOW())
            RETURNING id
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&item.command_type)
        .bind(&item.partition_key)
        .bind(&item.dedupe_key)
        .bind(&item.payload)
        .bind(item.max_attempts)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(EnqueueResult::Created(id))
    }

    async fn claim(&self, worker_id: &str, limit: usize) -> QueueResult<Vec<WorkItem>> {
        let items = sqlx::query_as::<_, WorkItem>(
            r#"
            WITH heads AS (
                SELECT DISTINCT ON (partition_key) id
                FROM work_items
                WHERE status IN ('pending', 'running')
                ORDER BY partition_key, created_at, id
            ),
            next_items AS (
                SELECT w.id
                FROM work_items w
                JOIN heads h ON h.id = w.id
                WHERE (w.status = 'pending' AND w.next_run_at <= NOW())
                   OR (w.status = 'running' AND w.lease_expires_at < NOW())
                ORDER BY w.created_at
                LIMIT $1
                FOR UPDATE OF w SKIP LOCKED
            )
            UPDATE work_items
            SET status = 'running',
                attempt = attempt + 1,
                worker_id = $2,
                lease_expires_at = NOW() + ($3 || ' milliseconds')::INTERVAL,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_items)
              AND (status = 'pending' OR (status = 'running' AND lease_expires_at < NOW()))
            RETURNING id, command_type, partition_key, dedupe_key, payload, status, attempt,
                      max_attempts, worker_id, lease_expires_at, next_run_at, error_message,
                      created_at, updated_at
            "#,
        )
        .bind(limit as i64)
        .bind(worker_id)
        .bind(self.lease_ms.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }

    async fn mark_succeeded(&self, delivery: &WorkItem) -> QueueResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE work_items
            SET status = 'succeeded',
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1
              AND status = 'running'
              AND worker_id = $2
              AND attempt = $3
            "#,
        )
        .bind(delivery.id)
        .bind(&delivery.worker_id)
        .bind(delivery.attempt)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // NotFound if the item is gone, otherwise another delivery owns it
            self.find_by_id(delivery.id).await?;
            debug!(item_id = %delivery.id, attempt = delivery.attempt, "ignoring stale ack");
            return Ok(false);
        }
        Ok(true)
    }

    async fn mark_failed(
        &self,
        delivery: &WorkItem,
        error: &str,
    ) -> QueueResult<Option<WorkItemStatus>> {
        let status = sqlx::query_scalar::<_, WorkItemStatus>(
            r#"
            UPDATE work_items
            SET status = CASE
                    WHEN attempt >= max_attempts THEN 'dead_letter'::work_item_status
                    ELSE 'pending'::work_item_status
                END,
                next_run_at = NOW() + make_interval(secs => LEAST(power(2, attempt), 3600)),
                error_message = $4,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1
              AND status = 'running'
              AND worker_id = $2
              AND attempt = $3
            RETURNING status
            "#,
        )
        .bind(delivery.id)
        .bind(&delivery.worker_id)
        .bind(delivery.attempt)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;

        let Some(status) = status else {
            self.find_by_id(delivery.id).await?;
            debug!(item_id = %delivery.id, attempt = delivery.attempt, "ignoring stale ack");
            return Ok(None);
        };

        if status == WorkItemStatus::DeadLetter {
            info!(item_id = %delivery.id, error = %error, "work item moved to dead letter");
        }
        Ok(Some(status))
    }
}
