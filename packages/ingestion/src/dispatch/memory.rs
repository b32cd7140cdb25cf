//! In-process work queue with the same ordering guarantees as the
//! PostgreSQL queue. Used by tests and single-node development setups.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::queue::{
    retry_delay, EnqueueResult, NewWorkItem, WorkItem, WorkItemStatus, WorkQueue,
    DEFAULT_DEDUPE_WINDOW_SECS, DEFAULT_LEASE_MS,
};
use crate::error::{QueueError, QueueResult};

#[derive(Default)]
struct Inner {
    items: HashMap<Uuid, WorkItem>,
    /// Open item ids in enqueue order
    order: Vec<Uuid>,
    dedupe: HashMap<String, (Uuid, DateTime<Utc>)>,
}

impl Inner {
    /// Forget dedupe keys and settled items older than `cutoff`.
    fn prune(&mut self, cutoff: DateTime<Utc>) {
        self.dedupe.retain(|_, (_, enqueued_at)| *enqueued_at > cutoff);
        self.items.retain(|_, item| item.is_open() || item.updated_at > cutoff);
    }
}

pub struct MemoryWorkQueue {
    inner: Mutex<Inner>,
    dedupe_window: Duration,
    lease: Duration,
}

impl Default for MemoryWorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryWorkQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            dedupe_window: Duration::seconds(DEFAULT_DEDUPE_WINDOW_SECS),
            lease: Duration::milliseconds(DEFAULT_LEASE_MS),
        }
    }

    /// Dedupe keys and settled items are kept for this long.
    pub fn with_dedupe_window(mut self, window: Duration) -> Self {
        self.dedupe_window = window;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Snapshot of open items plus items settled within the dedupe window,
    /// in no particular order.
    pub async fn items(&self) -> Vec<WorkItem> {
        self.inner.lock().await.items.values().cloned().collect()
    }

    /// Number of pending or running items.
    pub async fn open_count(&self) -> usize {
        self.inner.lock().await.order.len()
    }

    /// Number of dedupe keys still remembered.
    pub async fn dedupe_key_count(&self) -> usize {
        self.inner.lock().await.dedupe.len()
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn enqueue(&self, item: NewWorkItem) -> QueueResult<EnqueueResult> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        inner.prune(now - self.dedupe_window);

        if let Some((existing, _)) = inner.dedupe.get(&item.dedupe_key) {
            let dead = inner
                .items
                .get(existing)
                .is_some_and(|i| i.status == WorkItemStatus::DeadLetter);
            if !dead {
                return Ok(EnqueueResult::Duplicate(*existing));
            }
        }

        let item = WorkItem::from_new(item);
        let id = item.id;
        inner.dedupe.insert(item.dedupe_key.clone(), (id, now));
        inner.order.push(id);
        inner.items.insert(id, item);
        Ok(EnqueueResult::Created(id))
    }

    async fn claim(&self, worker_id: &str, limit: usize) -> QueueResult<Vec<WorkItem>> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let Inner { items, order, .. } = &mut *inner;

        let mut seen_partitions = HashSet::new();
        let mut claimed = Vec::new();

        for id in order.iter() {
            if claimed.len() >= limit {
                break;
            }
            let Some(item) = items.get_mut(id) else {
                continue;
            };
            // Only the head of each partition is eligible
            if !seen_partitions.insert(item.partition_key.clone()) {
                continue;
            }
            if !item.is_claimable(now) {
                continue;
            }

            item.status = WorkItemStatus::Running;
            item.attempt += 1;
            item.worker_id = Some(worker_id.to_string());
            item.lease_expires_at = Some(now + self.lease);
            item.updated_at = now;
            claimed.push(item.clone());
        }

        Ok(claimed)
    }

    async fn mark_succeeded(&self, delivery: &WorkItem) -> QueueResult<bool> {
        let mut inner = self.inner.lock().await;
        let item = inner
            .items
            .get_mut(&delivery.id)
            .ok_or(QueueError::NotFound(delivery.id))?;

        if !item.is_held_by(delivery) {
            debug!(item_id = %delivery.id, attempt = delivery.attempt, "ignoring stale ack");
            return Ok(false);
        }

        item.status = WorkItemStatus::Succeeded;
        item.lease_expires_at = None;
        item.updated_at = Utc::now();
        inner.order.retain(|id| *id != delivery.id);
        Ok(true)
    }

    async fn mark_failed(
        &self,
        delivery: &WorkItem,
        error: &str,
    ) -> QueueResult<Option<WorkItemStatus>> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let item = inner
            .items
            .get_mut(&delivery.id)
            .ok_or(QueueError::NotFound(delivery.id))?;

        if !item.is_held_by(delivery) {
            debug!(item_id = %delivery.id, attempt = delivery.attempt, "ignoring stale ack");
            return Ok(None);
        }

        item.error_message = Some(error.to_string());
        item.lease_expires_at = None;
        item.updated_at = now;

        let status = if item.attempt >= item.max_attempts {
            WorkItemStatus::DeadLetter
        } else {
            item.next_run_at = now + retry_delay(item.attempt);
            WorkItemStatus::Pending
        };
        item.status = status;

        if status == WorkItemStatus::DeadLetter {
            info!(item_id = %delivery.id, error = %error, "work item moved to dead letter");
            inner.order.retain(|id| *id != delivery.id);
        }
        Ok(Some(status))
    }
}
