//! Process-wide advisory lock registry shared by every `Kv` backend.
//!
//! Locks are keyed by name (for action-log entries: the entry's full encoded
//! key, stringified — spec §5), exclusive, and not reentrant. They are
//! orthogonal to batch atomicity: acquiring a lock says nothing about what
//! else may be reading/writing the store, it only serializes other holders
//! of the same name.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::kv::LockGuard;

#[derive(Default)]
pub struct LockRegistry {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        LockRegistry::default()
    }

    fn entry(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn lock(&self, name: &str) -> LockGuard {
        let mutex = self.entry(name);
        let guard = mutex.lock_owned().await;
        LockGuard {
            _permit: Box::new(guard),
        }
    }
}
