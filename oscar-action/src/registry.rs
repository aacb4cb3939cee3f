use async_trait::async_trait;
use thiserror::Error;

/// Error returned by an `Actioner::run`, classified so the runner knows
/// whether to leave the entry retryable (spec §7).
#[derive(Debug, Error, Clone)]
pub enum ActionError {
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Terminal(String),
}

impl ActionError {
    pub fn message(&self) -> &str {
        match self {
            ActionError::Transient(m) | ActionError::Terminal(m) => m,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionError::Terminal(_))
    }
}

/// A registered actioner turns a log entry's opaque `action` bytes into a
/// real side effect (spec §4.5). Mirrors the teacher's `ProcessStore`
/// trait shape: one `async_trait`, `Send + Sync`, fully opaque payloads.
#[async_trait]
pub trait Actioner: Send + Sync {
    async fn run(&self, action: &[u8]) -> Result<Vec<u8>, ActionError>;

    /// Human-readable rendering for dashboards and approval UIs.
    fn for_display(&self, action: &[u8]) -> String {
        format!("{} bytes of opaque action data", action.len())
    }
}
