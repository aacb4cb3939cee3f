//! Persistent `Kv` backend over `redb`, an embedded ordered key-value store.
//!
//! `submerge-rowdb` (the teacher's sibling crate, `submerge-rowdb/Cargo.toml`)
//! declares a dependency on `redb = "2.0"` for exactly this role — a
//! byte-ordered, transactional, single-file store — but never grew an
//! implementation. This module is that implementation, adapted to the
//! `Kv` trait instead of `submerge`'s row/column split.

use async_trait::async_trait;
use oscar_base::{OscarError, Result};
use redb::{Range, ReadableTable, TableDefinition};
use std::path::Path;

use crate::kv::{Batch, Kv, KvEntry, LockGuard};
use crate::lock::LockRegistry;

const TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("oscar_kv");

pub struct RedbKv {
    db: redb::Database,
    locks: LockRegistry,
}

impl RedbKv {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = redb::Database::create(path).map_err(|e| OscarError::storage(e.to_string()))?;
        {
            // Ensure the table exists even before the first write, so reads
            // against a fresh database don't have to special-case "no table".
            let txn = db.begin_write().map_err(|e| OscarError::storage(e.to_string()))?;
            {
                txn.open_table(TABLE).map_err(|e| OscarError::storage(e.to_string()))?;
            }
            txn.commit().map_err(|e| OscarError::storage(e.to_string()))?;
        }
        Ok(RedbKv {
            db,
            locks: LockRegistry::new(),
        })
    }
}

#[async_trait]
impl Kv for RedbKv {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(|e| OscarError::storage(e.to_string()))?;
        let table = txn.open_table(TABLE).map_err(|e| OscarError::storage(e.to_string()))?;
        let v = table
            .get(key)
            .map_err(|e| OscarError::storage(e.to_string()))?
            .map(|guard| guard.value().to_vec());
        Ok(v)
    }

    async fn apply(&self, batch: Batch) -> Result<()> {
        let txn = self.db.begin_write().map_err(|e| OscarError::storage(e.to_string()))?;
        {
            let mut table = txn.open_table(TABLE).map_err(|e| OscarError::storage(e.to_string()))?;
            for op in batch.ops {
                match op {
                    crate::kv::Op::Set(k, v) => {
                        table
                            .insert(k.as_slice(), v.as_slice())
                            .map_err(|e| OscarError::storage(e.to_string()))?;
                    }
                    crate::kv::Op::Delete(k) => {
                        table
                            .remove(k.as_slice())
                            .map_err(|e| OscarError::storage(e.to_string()))?;
                    }
                    crate::kv::Op::DeleteRange(lo, hi) => {
                        // `Range::remove` on a redb table is not inclusive on
                        // the upper bound, so widen by one byte conceptually:
                        // collect keys first (range is typically small — a
                        // kind prefix or a single watcher cursor), then remove.
                        let keys: Vec<Vec<u8>> = {
                            let mut out = Vec::new();
                            let it: Range<'_, &[u8], &[u8]> = table
                                .range(lo.as_slice()..=hi.as_slice())
                                .map_err(|e| OscarError::storage(e.to_string()))?;
                            for item in it {
                                let (k, _) = item.map_err(|e| OscarError::storage(e.to_string()))?;
                                out.push(k.value().to_vec());
                            }
                            out
                        };
                        for k in keys {
                            table
                                .remove(k.as_slice())
                                .map_err(|e| OscarError::storage(e.to_string()))?;
                        }
                    }
                }
            }
        }
        txn.commit().map_err(|e| OscarError::storage(e.to_string()))?;
        Ok(())
    }

    async fn scan(&self, lo: &[u8], hi: &[u8]) -> Result<Vec<KvEntry>> {
        let txn = self.db.begin_read().map_err(|e| OscarError::storage(e.to_string()))?;
        let table = txn.open_table(TABLE).map_err(|e| OscarError::storage(e.to_string()))?;
        let mut out = Vec::new();
        let it = table
            .range(lo..=hi)
            .map_err(|e| OscarError::storage(e.to_string()))?;
        for item in it {
            let (k, v) = item.map_err(|e| OscarError::storage(e.to_string()))?;
            out.push((k.value().to_vec(), v.value().to_vec()));
        }
        Ok(out)
    }

    async fn lock(&self, name: &str) -> Result<LockGuard> {
        Ok(self.locks.lock(name).await)
    }

    async fn flush(&self) -> Result<()> {
        // redb commits are durable per-transaction; nothing to batch-flush.
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn set_get_scan_roundtrip() {
        let dir = tempdir();
        let kv = RedbKv::open(dir.join("test.redb")).unwrap();
        kv.set(b"a", b"1").await.unwrap();
        kv.set(b"b", b"2").await.unwrap();
        assert_eq!(kv.get(b"a").await.unwrap(), Some(b"1".to_vec()));
        let scanned = kv.scan(b"a", b"z").await.unwrap();
        assert_eq!(scanned.len(), 2);
        std::fs::remove_dir_all(dir).ok();
    }

    fn tempdir() -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("oscar-kv-test-{}", std::process::id()));
        std::fs::create_dir_all(&p).unwrap();
        p
    }
}
