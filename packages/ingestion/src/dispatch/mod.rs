//! Ordered work dispatch.
//!
//! Items are partitioned (one partition per source) and deduplicated on
//! enqueue. Within a partition, items are delivered strictly one at a time
//! in enqueue order; partitions proceed concurrently. Delivery is
//! at-least-once: an item whose lease expires is handed out again.

pub mod memory;
pub mod queue;
pub mod worker;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryWorkQueue;
pub use queue::{
    retry_delay, EnqueueResult, NewWorkItem, WorkCommand, WorkItem, WorkItemStatus, WorkQueue,
    DEFAULT_DEDUPE_WINDOW_SECS, DEFAULT_LEASE_MS, DEFAULT_MAX_ATTEMPTS,
};
pub use worker::{DispatcherConfig, WorkDispatcher, WorkHandler};

#[cfg(feature = "postgres")]
pub use postgres::PostgresWorkQueue;
