use oscar_base::{Versioned, WallNanos};
use oscar_timed::DbTime;
use serde::{Deserialize, Serialize};

use crate::policy::PolicyVerdict;

/// A single approval/denial record (spec §3: `Decisions list of {Name, Time,
/// Approved}`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Decision {
    pub name: String,
    pub time: WallNanos,
    pub approved: bool,
}

/// One action-log entry (spec §3 "Action log entry").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionEntry {
    pub created: WallNanos,
    /// Zero until the entry completes.
    pub done: WallNanos,
    pub mod_time: DbTime,
    pub namespace: String,
    /// The ordered-encoded identifier the actioner supplied.
    pub key: Vec<u8>,
    pub unique: u64,
    pub action: Vec<u8>,
    #[serde(default)]
    pub result: Vec<u8>,
    #[serde(default)]
    pub error: String,
    pub approval_required: bool,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    /// Verdicts from a configured `PolicyChecker`, stored alongside the
    /// result they were computed against (spec §6). Empty when no policy
    /// checker is configured on the runner.
    #[serde(default)]
    pub policy_verdicts: Vec<PolicyVerdict>,
}

impl ActionEntry {
    /// spec §3: "approved iff !ApprovalRequired || (len(Decisions)>=1 &&
    /// all Approved)" — a single denial is a permanent veto (until more
    /// decisions arrive and change the majority, since the predicate is
    /// recomputed fresh each time, not cached).
    pub fn approved(&self) -> bool {
        !self.approval_required || (!self.decisions.is_empty() && self.decisions.iter().all(|d| d.approved))
    }

    pub fn is_done(&self) -> bool {
        self.done != 0
    }
}

pub type StoredEntry = Versioned<ActionEntry>;
