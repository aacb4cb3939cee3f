use thiserror::Error;

/// Error taxonomy shared by every crate in the workspace.
///
/// `Fatal` covers the invariant violations described in spec §7: double
/// completion of a log entry, dispatch to an unregistered namespace,
/// approval decisions on a non-approvable entry, corrupt keys. Callers are
/// not expected to recover from `Fatal` — the documented contract is to
/// propagate it to the process boundary and abort, same as the teacher's
/// use of `anyhow` errors that bubble out of `ProcessStore` methods into
/// `main`.
#[derive(Debug, Error)]
pub enum OscarError {
    #[error("invariant violation: {0}")]
    Fatal(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("entry not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, OscarError>;

impl OscarError {
    pub fn fatal(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!(target: "oscar", "fatal invariant violation: {msg}");
        OscarError::Fatal(msg)
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        OscarError::Storage(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        OscarError::NotFound(msg.into())
    }

    /// True for errors that represent a programmer-error / invariant
    /// violation rather than an environmental failure.
    pub fn is_fatal(&self) -> bool {
        matches!(self, OscarError::Fatal(_))
    }
}
