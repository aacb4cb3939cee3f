//! In-memory `Kv` backend, used by every unit test in the workspace and by
//! the facade's runnable examples.
//!
//! Grounded on the teacher's `MemoryStore` (`bpmn-lite-core/src/store_memory.rs`):
//! a single struct behind one `tokio::sync::RwLock`, holding the whole
//! dataset in an ordered map so scans are cheap range queries.

use async_trait::async_trait;
use oscar_base::Result;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use crate::kv::{Batch, Kv, KvEntry, LockGuard};
use crate::lock::LockRegistry;

#[derive(Default)]
pub struct MemKv {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    locks: LockRegistry,
}

impl MemKv {
    pub fn new() -> Self {
        MemKv::default()
    }
}

#[async_trait]
impl Kv for MemKv {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let r = self.data.read().await;
        Ok(r.get(key).cloned())
    }

    async fn apply(&self, batch: Batch) -> Result<()> {
        let mut w = self.data.write().await;
        for op in batch.ops {
            match op {
                crate::kv::Op::Set(k, v) => {
                    w.insert(k, v);
                }
                crate::kv::Op::Delete(k) => {
                    w.remove(&k);
                }
                crate::kv::Op::DeleteRange(lo, hi) => {
                    let keys: Vec<Vec<u8>> = w.range(lo..=hi).map(|(k, _)| k.clone()).collect();
                    for k in keys {
                        w.remove(&k);
                    }
                }
            }
        }
        Ok(())
    }

    async fn scan(&self, lo: &[u8], hi: &[u8]) -> Result<Vec<KvEntry>> {
        let r = self.data.read().await;
        Ok(r.range(lo.to_vec()..=hi.to_vec())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn lock(&self, name: &str) -> Result<LockGuard> {
        Ok(self.locks.lock(name).await)
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
