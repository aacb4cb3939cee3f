mod client;
mod queue;
mod task;

pub use client::{BisectOutcome, BisectionWork, ProgressSink, TaskClient};
pub use queue::{InProcessQueue, Queue, QueueError};
pub use task::{content_hash, Status, Task, TaskSpec};
