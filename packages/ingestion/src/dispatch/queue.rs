//! Work item model and the ordered queue trait.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::{QueueError, QueueResult};

/// Attempts before a work item is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

/// Enqueues sharing a dedupe key inside this window collapse into one item.
pub const DEFAULT_DEDUPE_WINDOW_SECS: i64 = 24 * 60 * 60;

/// How long a claimed item stays leased before it is redelivered.
pub const DEFAULT_LEASE_MS: i64 = 5 * 60 * 1000;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(
    feature = "postgres",
    sqlx(type_name = "work_item_status", rename_all = "snake_case")
)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    DeadLetter,
}

impl fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkItemStatus::Pending => "pending",
            WorkItemStatus::Running => "running",
            WorkItemStatus::Succeeded => "succeeded",
            WorkItemStatus::Failed => "failed",
            WorkItemStatus::DeadLetter => "dead_letter",
        };
        f.write_str(s)
    }
}

/// Result type for enqueue operations that handles deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    /// Item was enqueued, returns new item ID
    Created(Uuid),
    /// Dedupe key seen within the window, returns existing item ID
    Duplicate(Uuid),
}

impl EnqueueResult {
    /// Get the item ID regardless of whether it was created or duplicate
    pub fn item_id(&self) -> Uuid {
        match self {
            EnqueueResult::Created(id) | EnqueueResult::Duplicate(id) => *id,
        }
    }

    /// Returns true if this was a newly created item
    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

// ============================================================================
// Commands
// ============================================================================

/// Metadata for work item serialization.
///
/// Commands implement this to declare how they are partitioned and
/// deduplicated.
pub trait WorkCommand: Serialize {
    /// The command type name, used to route items to handlers.
    fn command_type(&self) -> &'static str;

    /// Items sharing a partition key are delivered strictly one at a time,
    /// in enqueue order.
    fn partition_key(&self) -> String;

    /// Items sharing a dedupe key within the dedupe window are delivered at
    /// most once.
    fn dedupe_key(&self) -> String;

    fn max_attempts(&self) -> i32 {
        DEFAULT_MAX_ATTEMPTS
    }
}

/// An item about to be enqueued.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewWorkItem {
    pub command_type: String,
    pub partition_key: String,
    pub dedupe_key: String,
    pub payload: serde_json::Value,
    #[builder(default = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: i32,
}

impl NewWorkItem {
    /// Serialize a command into an enqueueable item.
    pub fn for_command<C: WorkCommand>(command: &C) -> QueueResult<Self> {
        let payload =
            serde_json::to_value(command).map_err(|e| QueueError::InvalidPayload {
                command_type: command.command_type().to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self::builder()
            .command_type(command.command_type())
            .partition_key(command.partition_key())
            .dedupe_key(command.dedupe_key())
            .payload(payload)
            .max_attempts(command.max_attempts())
            .build())
    }
}

// ============================================================================
// Work Item Model
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct WorkItem {
    pub id: Uuid,
    pub command_type: String,
    pub partition_key: String,
    pub dedupe_key: String,
    pub payload: serde_json::Value,
    pub status: WorkItemStatus,
    /// Deliveries so far, incremented on every claim
    pub attempt: i32,
    pub max_attempts: i32,
    pub worker_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn from_new(item: NewWorkItem) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            command_type: item.command_type,
            partition_key: item.partition_key,
            dedupe_key: item.dedupe_key,
            payload: item.payload,
            status: WorkItemStatus::Pending,
            attempt: 0,
            max_attempts: item.max_attempts,
            worker_id: None,
            lease_expires_at: None,
            next_run_at: now,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Deserialize the command payload.
    pub fn deserialize<C: DeserializeOwned>(&self) -> QueueResult<C> {
        serde_json::from_value(self.payload.clone()).map_err(|e| QueueError::InvalidPayload {
            command_type: self.command_type.clone(),
            reason: e.to_string(),
        })
    }

    /// Whether this item is the one a claimer may take for its partition.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            WorkItemStatus::Pending => self.next_run_at <= now,
            WorkItemStatus::Running => self.lease_expires_at.map_or(true, |lease| lease < now),
            _ => false,
        }
    }

    /// Whether `delivery` is the current lease on this item.
    pub fn is_held_by(&self, delivery: &WorkItem) -> bool {
        self.status == WorkItemStatus::Running
            && self.attempt == delivery.attempt
            && self.worker_id == delivery.worker_id
    }

    /// Pending or running items hold their partition.
    pub fn is_open(&self) -> bool {
        matches!(self.status, WorkItemStatus::Pending | WorkItemStatus::Running)
    }
}

/// Exponential retry delay after `attempt` failed deliveries, capped at an hour.
pub fn retry_delay(attempt: i32) -> Duration {
    let exponent = attempt.clamp(0, 12) as u32;
    Duration::seconds(2i64.pow(exponent).min(3600))
}

// ============================================================================
// Queue Trait
// ============================================================================

/// Durable queue with per-partition serialization and enqueue deduplication.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueue an item.
    ///
    /// Returns `EnqueueResult::Duplicate` if an item with the same dedupe key
    /// was enqueued within the dedupe window and has not been dead-lettered.
    async fn enqueue(&self, item: NewWorkItem) -> QueueResult<EnqueueResult>;

    /// Claim up to `limit` items, at most one per partition.
    ///
    /// Only the oldest open item of a partition is eligible, and only when no
    /// other item of that partition holds a live lease.
    async fn claim(&self, worker_id: &str, limit: usize) -> QueueResult<Vec<WorkItem>>;

    /// Mark a claimed delivery as successfully completed.
    ///
    /// The ack only applies while `item` is still the live delivery: same
    /// worker, same attempt, still running. Returns `false` when the item has
    /// since been redelivered or settled, in which case nothing changes.
    async fn mark_succeeded(&self, item: &WorkItem) -> QueueResult<bool>;

    /// Mark a claimed delivery as failed.
    ///
    /// If attempts remain the item returns to pending after a backoff,
    /// keeping its place at the head of the partition. Otherwise it is
    /// moved to dead letter. Returns `None` for a stale delivery, which is
    /// left untouched.
    async fn mark_failed(
        &self,
        item: &WorkItem,
        error: &str,
    ) -> QueueResult<Option<WorkItemStatus>>;
}
