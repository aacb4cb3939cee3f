use oscar_base::WallNanos;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The stable identifying fields of a bisection (spec §3 "async task"). Two
/// specs with the same fields hash to the same task ID, so duplicate
/// submissions collapse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub trigger: String,
    pub issue: String,
    pub repository: String,
    pub good: String,
    pub bad: String,
    pub regression: String,
}

/// Hex SHA-256 of the spec's identifying fields, joined by a byte that
/// cannot appear in any of them (`\0`), so field boundaries can't be
/// shuffled into a collision.
pub fn content_hash(spec: &TaskSpec) -> String {
    let mut hasher = Sha256::new();
    for field in [&spec.repository, &spec.issue, &spec.trigger, &spec.good, &spec.bad, &spec.regression] {
        hasher.update(field.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Succeeded | Status::Failed | Status::Canceled)
    }
}

/// One bisection task (spec §3). `task_id` is carried inline so a scan over
/// the kind (e.g. `find_stale`) never has to re-derive the key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub status: Status,
    pub trigger: String,
    pub issue: String,
    pub repository: String,
    pub good: String,
    pub bad: String,
    pub regression: String,
    pub created: WallNanos,
    pub updated: WallNanos,
    #[serde(default)]
    pub result: Vec<u8>,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub output: String,
}
