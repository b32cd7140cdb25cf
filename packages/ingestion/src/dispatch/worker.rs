//! Work dispatcher service.
//!
//! The `WorkDispatcher` is a long-running service that:
//! - Claims ready items from a `WorkQueue` (at most one per partition)
//! - Routes each item to the `WorkHandler` registered for its command type
//! - Runs up to `concurrency` handlers at once
//! - Marks items succeeded or failed so the queue can retry or dead-letter
//!
//! ```text
//! WorkDispatcher
//!     │
//!     ├─► claim (WorkQueue)
//!     ├─► spawn handler (JoinSet, bounded by concurrency)
//!     │       └─► WorkHandler.handle(item)
//!     ├─► mark_succeeded / mark_failed (WorkQueue)
//!     └─► dead letter ─► WorkHandler.on_dead_letter (retried until it succeeds)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::queue::{WorkItem, WorkItemStatus, WorkQueue};
use crate::error::{QueueResult, Result};

/// Configuration for the work dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum number of items processed at once
    pub concurrency: usize,
    /// How long to wait when no items are available
    pub poll_interval: Duration,
    /// Worker ID for this instance
    pub worker_id: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            poll_interval: Duration::from_secs(1),
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

impl DispatcherConfig {
    /// Create a new config with a specific worker ID.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Processes one claimed item.
///
/// Handlers must be idempotent: delivery is at-least-once.
#[async_trait]
pub trait WorkHandler: Send + Sync {
    /// Command type this handler accepts.
    fn command_type(&self) -> &'static str;

    async fn handle(&self, item: &WorkItem) -> Result<()>;

    /// Called once the queue moves an item to dead letter.
    ///
    /// A failed hook is retried on the dispatcher's next poll.
    async fn on_dead_letter(&self, _item: &WorkItem, _error: &str) -> Result<()> {
        Ok(())
    }
}

type HandlerMap = HashMap<&'static str, Arc<dyn WorkHandler>>;

/// A dead-letter hook that has not yet succeeded.
struct DeadLetter {
    item: WorkItem,
    error: String,
}

type DeadLetterBacklog = Arc<Mutex<Vec<DeadLetter>>>;

pub struct WorkDispatcher {
    queue: Arc<dyn WorkQueue>,
    handlers: Arc<HandlerMap>,
    dead_letters: DeadLetterBacklog,
    config: DispatcherConfig,
}

impl WorkDispatcher {
    pub fn new(queue: Arc<dyn WorkQueue>, config: DispatcherConfig) -> Self {
        Self {
            queue,
            handlers: Arc::new(HashMap::new()),
            dead_letters: Arc::new(Mutex::new(Vec::new())),
            config,
        }
    }

    /// Register a handler for its command type.
    pub fn with_handler(mut self, handler: Arc<dyn WorkHandler>) -> Self {
        let mut handlers = (*self.handlers).clone();
        handlers.insert(handler.command_type(), handler);
        self.handlers = Arc::new(handlers);
        self
    }

    /// Poll and process until `shutdown` is cancelled, then drain in-flight
    /// items.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            worker_id = %self.config.worker_id,
            concurrency = self.config.concurrency,
            "work dispatcher starting"
        );

        let mut in_flight = JoinSet::new();

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            self.retry_dead_letter_hooks().await;

            let capacity = self.config.concurrency.saturating_sub(in_flight.len());
            let mut claimed = 0;
            if capacity > 0 {
                match self.queue.claim(&self.config.worker_id, capacity).await {
                    Ok(items) => {
                        claimed = items.len();
                        if claimed > 0 {
                            debug!(count = claimed, "claimed work items");
                        }
                        for item in items {
                            in_flight.spawn(process_item(
                                self.queue.clone(),
                                self.handlers.clone(),
                                self.dead_letters.clone(),
                                item,
                            ));
                        }
                    }
                    Err(e) => error!(error = %e, "failed to claim work items"),
                }
            }

            if claimed > 0 {
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        if !in_flight.is_empty() {
            info!(count = in_flight.len(), "waiting for in-flight work items");
        }
        while in_flight.join_next().await.is_some() {}

        info!(worker_id = %self.config.worker_id, "work dispatcher stopped");
    }

    /// Process claimable items until the queue has nothing ready.
    ///
    /// Items are processed one at a time; returns how many were handled.
    pub async fn run_until_idle(&self) -> QueueResult<usize> {
        self.retry_dead_letter_hooks().await;

        let mut processed = 0;
        loop {
            let items = self.queue.claim(&self.config.worker_id, 1).await?;
            if items.is_empty() {
                return Ok(processed);
            }
            for item in items {
                process_item(
                    self.queue.clone(),
                    self.handlers.clone(),
                    self.dead_letters.clone(),
                    item,
                )
                .await;
                processed += 1;
            }
        }
    }

    /// Number of dead-letter hooks waiting to be retried.
    pub async fn dead_letter_backlog(&self) -> usize {
        self.dead_letters.lock().await.len()
    }

    async fn retry_dead_letter_hooks(&self) {
        let backlog = std::mem::take(&mut *self.dead_letters.lock().await);
        for dead in backlog {
            run_dead_letter_hook(&self.handlers, &self.dead_letters, dead).await;
        }
    }
}

async fn process_item(
    queue: Arc<dyn WorkQueue>,
    handlers: Arc<HandlerMap>,
    dead_letters: DeadLetterBacklog,
    item: WorkItem,
) {
    let item_id = item.id;

    let Some(handler) = handlers.get(item.command_type.as_str()) else {
        error!(item_id = %item_id, command_type = %item.command_type, "no handler registered");
        let message = format!("no handler for command type: {}", item.command_type);
        if let Err(e) = queue.mark_failed(&item, &message).await {
            error!(item_id = %item_id, error = %e, "failed to mark work item as failed");
        }
        return;
    };

    match handler.handle(&item).await {
        Ok(()) => match queue.mark_succeeded(&item).await {
            Ok(true) => {
                debug!(item_id = %item_id, partition = %item.partition_key, "work item succeeded")
            }
            Ok(false) => {
                warn!(item_id = %item_id, attempt = item.attempt, "lease lost before ack")
            }
            Err(e) => {
                error!(item_id = %item_id, error = %e, "failed to mark work item as succeeded")
            }
        },
        Err(e) => {
            warn!(
                item_id = %item_id,
                partition = %item.partition_key,
                attempt = item.attempt,
                error = %e,
                "work item failed"
            );
            let error = e.to_string();
            match queue.mark_failed(&item, &error).await {
                Ok(Some(WorkItemStatus::DeadLetter)) => {
                    run_dead_letter_hook(&handlers, &dead_letters, DeadLetter { item, error })
                        .await;
                }
                Ok(None) => {
                    warn!(item_id = %item_id, attempt = item.attempt, "lease lost before ack")
                }
                Ok(Some(_)) => {}
                Err(e) => {
                    error!(item_id = %item_id, error = %e, "failed to mark work item as failed")
                }
            }
        }
    }
}

async fn run_dead_letter_hook(
    handlers: &HandlerMap,
    dead_letters: &DeadLetterBacklog,
    dead: DeadLetter,
) {
    let Some(handler) = handlers.get(dead.item.command_type.as_str()) else {
        return;
    };

    if let Err(e) = handler.on_dead_letter(&dead.item, &dead.error).await {
        error!(item_id = %dead.item.id, error = %e, "dead-letter hook failed, will retry");
        dead_letters.lock().await.push(dead);
    }
}
