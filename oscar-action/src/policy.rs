//! Optional policy-checker hook (spec §6): evaluates a generated text
//! against configured policies before its result is accepted. No policy
//! ships with this core — embedding processes register one on
//! `RunnerConfig` when they have policies to enforce.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Per-policy verdict, stored on the action log entry alongside the
/// result it was computed against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyVerdict {
    pub policy: String,
    pub allowed: bool,
    #[serde(default)]
    pub reason: String,
}

#[async_trait]
pub trait PolicyChecker: Send + Sync {
    /// Evaluates `text` (and the prompts that produced it) against every
    /// configured policy, returning one verdict per policy checked. An
    /// empty list means no policies are configured.
    async fn check(&self, prompts: &[String], text: &str) -> Vec<PolicyVerdict>;
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    pub struct DenyContaining(pub &'static str);

    #[async_trait]
    impl PolicyChecker for DenyContaining {
        async fn check(&self, _prompts: &[String], text: &str) -> Vec<PolicyVerdict> {
            vec![PolicyVerdict {
                policy: "no-banned-words".into(),
                allowed: !text.contains(self.0),
                reason: if text.contains(self.0) {
                    format!("text contains banned substring {:?}", self.0)
                } else {
                    String::new()
                },
            }]
        }
    }
}
