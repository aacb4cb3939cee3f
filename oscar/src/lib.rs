//! Wiring for the durable action orchestration core: one `Kv`, the action
//! log built over it, and the config knobs an embedding process tunes.
//!
//! This crate does not ship any actioner, adapter, or policy-checker
//! implementation — those are registered by the embedding process (spec
//! §1 Non-goals).

use std::sync::Arc;

use oscar_action::{ActionLog, RunnerConfig};
use oscar_kv::Kv;
use oscar_task::{InProcessQueue, Queue, TaskClient};

/// Aggregate tunables for the components wired up by `Core`, following the
/// teacher's `parse_database_url`-style "small struct, `Default`,
/// overridable by the embedder" configuration convention.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub runner: RunnerConfig,
    /// How old `Updated` must be, in nanoseconds, before a task is
    /// considered stale and eligible for `restart` (spec §2a).
    pub stale_task_deadline_nanos: i64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            runner: RunnerConfig::default(),
            // 30 minutes, matching a typical cloud-task visibility timeout.
            stale_task_deadline_nanos: 30 * 60 * 1_000_000_000,
        }
    }
}

/// The wired-up core over one `Kv` backend and one `Queue`. Namespaces are
/// registered against `action_log` by the embedding process at startup.
pub struct Core<K: Kv, Q: Queue = InProcessQueue> {
    pub kv: Arc<K>,
    pub action_log: Arc<ActionLog<K>>,
    pub tasks: TaskClient<K, Q>,
    pub config: CoreConfig,
}

impl<K: Kv> Core<K, InProcessQueue> {
    /// Builds a core with the in-process queue stand-in (no external task
    /// service configured).
    pub fn new(kv: Arc<K>, config: CoreConfig) -> Self {
        Core::with_queue(kv, InProcessQueue, config)
    }
}

impl<K: Kv, Q: Queue> Core<K, Q> {
    pub fn with_queue(kv: Arc<K>, queue: Q, config: CoreConfig) -> Self {
        let action_log = ActionLog::new(kv.clone());
        let tasks = TaskClient::new(kv.clone(), queue);
        Core {
            kv,
            action_log,
            tasks,
            config,
        }
    }
}
