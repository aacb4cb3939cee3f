//! The async task client: durable bisection tasks bridged to an external
//! queue, with a parallel timed index so watchers can observe progress
//! (spec §4.6).

use std::sync::Arc;

use async_trait::async_trait;
use oscar_base::{OscarError, Result, Versioned, WallNanos};
use oscar_kv::{decode, Batch, Elem, Kv};
use oscar_timed::{clock, DbTime};

use crate::queue::Queue;
use crate::task::{content_hash, Status, Task, TaskSpec};

const TASK_KIND: &str = "bisection.Task";
const UPDATE_KIND: &str = "bisection.TaskUpdate";

type StoredTask = Versioned<Task>;

fn task_key(task_id: &str) -> Vec<u8> {
    oscar_kv::encode(&[Elem::str(TASK_KIND), Elem::str(task_id)])
}

fn task_scan_lo() -> Vec<u8> {
    oscar_kv::encode(&[Elem::str(TASK_KIND)])
}

fn task_scan_hi() -> Vec<u8> {
    oscar_kv::encode(&[Elem::str(TASK_KIND), Elem::PosInfinity])
}

fn update_row_key(t: DbTime, task_id: &str) -> Vec<u8> {
    oscar_kv::encode(&[Elem::str(UPDATE_KIND), Elem::str("ByTime"), Elem::I64(t), Elem::str(task_id)])
}

fn update_lo(after_exclusive: DbTime) -> Vec<u8> {
    oscar_kv::encode(&[Elem::str(UPDATE_KIND), Elem::str("ByTime"), Elem::I64(after_exclusive.saturating_add(1))])
}

fn update_hi() -> Vec<u8> {
    oscar_kv::encode(&[Elem::str(UPDATE_KIND), Elem::str("ByTime"), Elem::PosInfinity])
}

fn decode_update_key(key: &[u8]) -> Result<(DbTime, String)> {
    let elems = decode(key).map_err(|e| OscarError::storage(e.to_string()))?;
    match elems.as_slice() {
        [Elem::Str(_), Elem::Str(tag), Elem::I64(t), Elem::Str(task_id)] if tag == "ByTime" => Ok((*t, task_id.clone())),
        _ => Err(OscarError::storage("corrupt bisection.TaskUpdate row key")),
    }
}

fn lock_name(task_id: &str) -> String {
    format!("oscar.task.{task_id}")
}

fn wall_now() -> WallNanos {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as WallNanos)
        .unwrap_or(0)
}

/// The outcome `BisectionWork::run` reports back to the client.
pub struct BisectOutcome {
    pub result: Vec<u8>,
    pub output: String,
}

/// Lets running work persist incremental progress without waiting for
/// completion (spec §4.6: "periodically rewriting the task with updated
/// Status/Updated/Output").
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, output: &str) -> Result<()>;
}

/// A unit of bisection work dispatched by the queue's target handler.
#[async_trait]
pub trait BisectionWork: Send + Sync {
    async fn run(&self, progress: &dyn ProgressSink) -> std::result::Result<BisectOutcome, String>;
}

struct TaskProgress<'a, K: Kv, Q: Queue> {
    client: &'a TaskClient<K, Q>,
    task_id: &'a str,
}

/// Durable client over one `Kv` and one external `Queue`.
pub struct TaskClient<K: Kv, Q: Queue> {
    kv: Arc<K>,
    queue: Q,
}

#[async_trait]
impl<'a, K: Kv, Q: Queue> ProgressSink for TaskProgress<'a, K, Q> {
    async fn report(&self, output: &str) -> Result<()> {
        self.client.rewrite_progress(self.task_id, output).await
    }
}

impl<K: Kv, Q: Queue> TaskClient<K, Q> {
    pub fn new(kv: Arc<K>, queue: Q) -> Self {
        TaskClient { kv, queue }
    }

    async fn write_task(&self, task_id: &str, task: &Task) -> Result<DbTime> {
        let (guard, t) = clock::reserve(self.kv.as_ref()).await?;
        let stored = StoredTask::new(task.clone());
        let mut batch = Batch::new();
        batch.set(clock::clock_key(), t.to_be_bytes().to_vec());
        batch.set(task_key(task_id), stored.encode()?);
        batch.set(update_row_key(t, task_id), Vec::new());
        self.kv.apply(batch).await?;
        drop(guard);
        Ok(t)
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<Task>> {
        match self.kv.get(&task_key(task_id)).await? {
            Some(bytes) => Ok(Some(StoredTask::decode(&bytes)?.value)),
            None => Ok(None),
        }
    }

    /// Submits a bisection. Returns `(task_id, true)` if newly created, or
    /// `(task_id, false)` if an identical submission already exists — the
    /// queue is not contacted again in that case (spec §4.6, E5).
    pub async fn submit(&self, spec: TaskSpec) -> Result<(String, bool)> {
        let task_id = content_hash(&spec);
        let _guard = self.kv.lock(&lock_name(&task_id)).await?;
        if self.get(&task_id).await?.is_some() {
            return Ok((task_id, false));
        }

        match self.queue.enqueue(&task_id, &spec).await {
            Ok(true) => {}
            Ok(false) => return Err(OscarError::storage(format!("queue declined task {task_id}"))),
            Err(e) => return Err(OscarError::storage(format!("enqueue failed for {task_id}: {e}"))),
        }

        let now = wall_now();
        let task = Task {
            task_id: task_id.clone(),
            status: Status::Queued,
            trigger: spec.trigger,
            issue: spec.issue,
            repository: spec.repository,
            good: spec.good,
            bad: spec.bad,
            regression: spec.regression,
            created: now,
            updated: now,
            result: Vec::new(),
            error: String::new(),
            output: String::new(),
        };
        self.write_task(&task_id, &task).await?;
        tracing::info!(target: "oscar.task", task_id = %task_id, "task submitted");
        Ok((task_id, true))
    }

    /// Tasks touched since `after`, in DBTime order, via the parallel
    /// `bisection.TaskUpdate` index — the primitive a watcher over task
    /// progress scans (spec §3, §4.6).
    pub async fn scan_updates_after(&self, after: DbTime) -> Result<Vec<Task>> {
        let rows = self.kv.scan(&update_lo(after), &update_hi()).await?;
        let mut out = Vec::with_capacity(rows.len());
        for (key, _) in rows {
            let (_, task_id) = decode_update_key(&key)?;
            if let Some(task) = self.get(&task_id).await? {
                out.push(task);
            }
        }
        Ok(out)
    }

    /// Entries with `Updated` older than `deadline` that are not terminal —
    /// candidates for `restart` (spec §2a).
    pub async fn find_stale(&self, deadline: WallNanos) -> Result<Vec<String>> {
        let rows = self.kv.scan(&task_scan_lo(), &task_scan_hi()).await?;
        let mut out = Vec::new();
        for (_, v) in rows {
            let stored = StoredTask::decode(&v)?;
            if !stored.value.status.is_terminal() && stored.value.updated < deadline {
                out.push(stored.value.task_id);
            }
        }
        Ok(out)
    }

    /// Resets a stale, non-terminal task back to `Queued` so it can be
    /// redispatched. Does not itself re-enqueue with the external queue —
    /// that is the caller's decision (spec §2a: "restart is an explicit,
    /// narrow operation distinct from submission").
    pub async fn restart(&self, task_id: &str) -> Result<()> {
        let _guard = self.kv.lock(&lock_name(task_id)).await?;
        let mut task = self
            .get(task_id)
            .await?
            .ok_or_else(|| OscarError::not_found(format!("no such task {task_id}")))?;
        if task.status.is_terminal() {
            return Err(OscarError::fatal(format!("restart on terminal task {task_id}")));
        }
        task.status = Status::Queued;
        task.updated = wall_now();
        self.write_task(task_id, &task).await?;
        Ok(())
    }

    /// The queue's target handler: loads the task, runs `work` while the
    /// work reports progress, and finalizes with a terminal status.
    pub async fn bisect(&self, task_id: &str, work: Arc<dyn BisectionWork>) -> Result<()> {
        {
            let _guard = self.kv.lock(&lock_name(task_id)).await?;
            let mut task = self
                .get(task_id)
                .await?
                .ok_or_else(|| OscarError::fatal(format!("bisect on unknown task {task_id}")))?;
            task.status = Status::Running;
            task.updated = wall_now();
            self.write_task(task_id, &task).await?;
        }

        let progress = TaskProgress { client: self, task_id };
        let outcome = work.run(&progress).await;
        drop(progress);

        let _guard = self.kv.lock(&lock_name(task_id)).await?;
        let mut task = self
            .get(task_id)
            .await?
            .ok_or_else(|| OscarError::fatal(format!("bisect finalize on vanished task {task_id}")))?;
        match outcome {
            Ok(BisectOutcome { result, output }) => {
                task.status = Status::Succeeded;
                task.result = result;
                task.output = output;
            }
            Err(err) => {
                task.status = Status::Failed;
                task.error = err;
            }
        }
        task.updated = wall_now();
        self.write_task(task_id, &task).await?;
        Ok(())
    }

    async fn rewrite_progress(&self, task_id: &str, output: &str) -> Result<()> {
        let _guard = self.kv.lock(&lock_name(task_id)).await?;
        let mut task = self
            .get(task_id)
            .await?
            .ok_or_else(|| OscarError::fatal(format!("progress report on vanished task {task_id}")))?;
        task.output = output.to_string();
        task.updated = wall_now();
        self.write_task(task_id, &task).await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::queue::InProcessQueue;
    use oscar_kv::MemKv;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn spec(issue: &str) -> TaskSpec {
        TaskSpec {
            trigger: "nightly".into(),
            issue: issue.into(),
            repository: "go/oscar".into(),
            good: "abc".into(),
            bad: "def".into(),
            regression: "TestFoo".into(),
        }
    }

    #[tokio::test]
    async fn duplicate_submission_collapses_to_one_task() {
        let kv = Arc::new(MemKv::new());
        let client = TaskClient::new(kv, InProcessQueue);

        let (id1, created1) = client.submit(spec("42")).await.unwrap();
        let (id2, created2) = client.submit(spec("42")).await.unwrap();

        assert_eq!(id1, id2);
        assert!(created1);
        assert!(!created2);
        assert_eq!(client.scan_updates_after(0).await.unwrap().len(), 1);
    }

    struct SucceedingWork {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BisectionWork for SucceedingWork {
        async fn run(&self, progress: &dyn ProgressSink) -> std::result::Result<BisectOutcome, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            progress.report("halfway").await.map_err(|e| e.to_string())?;
            Ok(BisectOutcome {
                result: b"bisected to abc123".to_vec(),
                output: "done".into(),
            })
        }
    }

    #[tokio::test]
    async fn bisect_runs_work_and_finalizes_success() {
        let kv = Arc::new(MemKv::new());
        let client = TaskClient::new(kv, InProcessQueue);
        let (id, _) = client.submit(spec("7")).await.unwrap();

        let work = Arc::new(SucceedingWork { calls: AtomicUsize::new(0) });
        client.bisect(&id, work.clone()).await.unwrap();

        let task = client.get(&id).await.unwrap().unwrap();
        assert_eq!(task.status, Status::Succeeded);
        assert_eq!(task.result, b"bisected to abc123");
        assert_eq!(work.calls.load(Ordering::SeqCst), 1);
    }

    struct FailingWork;

    #[async_trait]
    impl BisectionWork for FailingWork {
        async fn run(&self, _progress: &dyn ProgressSink) -> std::result::Result<BisectOutcome, String> {
            Err("regression not found".into())
        }
    }

    #[tokio::test]
    async fn bisect_records_failure_as_terminal() {
        let kv = Arc::new(MemKv::new());
        let client = TaskClient::new(kv, InProcessQueue);
        let (id, _) = client.submit(spec("9")).await.unwrap();

        client.bisect(&id, Arc::new(FailingWork)).await.unwrap();

        let task = client.get(&id).await.unwrap().unwrap();
        assert_eq!(task.status, Status::Failed);
        assert_eq!(task.error, "regression not found");
    }

    #[tokio::test]
    async fn stale_non_terminal_task_can_be_restarted() {
        let kv = Arc::new(MemKv::new());
        let client = TaskClient::new(kv, InProcessQueue);
        let (id, _) = client.submit(spec("3")).await.unwrap();

        let stale = client.find_stale(i64::MAX).await.unwrap();
        assert_eq!(stale, vec![id.clone()]);

        client.restart(&id).await.unwrap();
        let task = client.get(&id).await.unwrap().unwrap();
        assert_eq!(task.status, Status::Queued);
    }
}
