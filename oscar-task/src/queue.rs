use async_trait::async_trait;
use thiserror::Error;

use crate::task::TaskSpec;

/// Failure reported by the external queue (spec §4.6's abstracted
/// `Enqueue`).
#[derive(Debug, Error, Clone)]
pub enum QueueError {
    #[error("queue rejected task: {0}")]
    Rejected(String),
    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

/// The external work queue the task client submits to (e.g. a cloud task
/// service). Not implemented by this crate — the actual queue is an
/// external collaborator (spec §1).
#[async_trait]
pub trait Queue: Send + Sync {
    /// Returns whether the queue accepted the task. An `Err` means nothing
    /// was persisted by the caller.
    async fn enqueue(&self, task_id: &str, spec: &TaskSpec) -> Result<bool, QueueError>;
}

/// An in-process queue that accepts every submission immediately and does
/// no external dispatch. Exercises the `TaskClient` durability contract in
/// tests without a real task service, mirroring the teacher's
/// `MemoryStore`-over-`ProcessStore` fake pattern.
#[derive(Debug, Default)]
pub struct InProcessQueue;

#[async_trait]
impl Queue for InProcessQueue {
    async fn enqueue(&self, _task_id: &str, _spec: &TaskSpec) -> Result<bool, QueueError> {
        Ok(true)
    }
}
