//! Job execution queue consumed by the orchestrator and drained by workers.
//!
//! Jobs leave the queue when dequeued. A worker that dies mid-batch leaves
//! the batch `running` in the ledger until an operator resets the ledger.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::SweepJob;

pub mod memory;
#[cfg(feature = "redis-backend")]
pub mod redis;

pub use memory::InProcJobQueue;
#[cfg(feature = "redis-backend")]
pub use self::redis::RedisJobQueue;

/// Abstracts the queue backend consumed by the orchestrator and workers.
#[async_trait]
pub trait JobQueue: Send + Sync + std::fmt::Debug {
    async fn enqueue(&self, queue: &str, job: &SweepJob) -> Result<()>;

    /// Pop the oldest job from the first non-empty queue, checked in order.
    async fn dequeue(&self, queues: &[String]) -> Result<Option<SweepJob>>;

    async fn depth(&self, queue: &str) -> Result<usize>;
}
