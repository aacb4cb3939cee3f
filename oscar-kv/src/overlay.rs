//! Copy-on-write composition of a read-only base and a writable top
//! (spec §4.1, "Overlay composition"), used for testing/staging against a
//! shared production snapshot without mutating it.

use async_trait::async_trait;
use oscar_base::Result;
use std::collections::BTreeSet;
use tokio::sync::RwLock;

use crate::kv::{Batch, Kv, KvEntry, LockGuard, Op};
use crate::memkv::MemKv;

/// Range-delete tombstones are tracked separately from point deletes so a
/// `DeleteRange` over the base doesn't require materializing every covered
/// key up front.
struct Tombstones {
    points: BTreeSet<Vec<u8>>,
    ranges: Vec<(Vec<u8>, Vec<u8>)>,
}

impl Tombstones {
    fn covers(&self, key: &[u8]) -> bool {
        self.points.contains(key) || self.ranges.iter().any(|(lo, hi)| lo.as_slice() <= key && key <= hi.as_slice())
    }
}

impl Default for Tombstones {
    fn default() -> Self {
        Tombstones {
            points: BTreeSet::new(),
            ranges: Vec::new(),
        }
    }
}

/// `Overlay(base, top)`: reads consult `top`, then tombstones, then `base`.
/// Writes and deletes land only in `top`. The base is never mutated, so many
/// overlays can share one base concurrently.
pub struct Overlay<B: Kv> {
    base: std::sync::Arc<B>,
    top: MemKv,
    tombstones: RwLock<Tombstones>,
}

impl<B: Kv> Overlay<B> {
    pub fn new(base: std::sync::Arc<B>) -> Self {
        Overlay {
            base,
            top: MemKv::new(),
            tombstones: RwLock::new(Tombstones::default()),
        }
    }
}

#[async_trait]
impl<B: Kv> Kv for Overlay<B> {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(v) = self.top.get(key).await? {
            return Ok(Some(v));
        }
        let tomb = self.tombstones.read().await;
        if tomb.covers(key) {
            return Ok(None);
        }
        drop(tomb);
        self.base.get(key).await
    }

    async fn apply(&self, batch: Batch) -> Result<()> {
        let mut tomb = self.tombstones.write().await;
        let mut top_batch = Batch::new();
        for op in &batch.ops {
            match op {
                Op::Set(k, v) => {
                    top_batch.set(k.clone(), v.clone());
                    tomb.points.remove(k);
                }
                Op::Delete(k) => {
                    top_batch.delete(k.clone());
                    tomb.points.insert(k.clone());
                }
                Op::DeleteRange(lo, hi) => {
                    top_batch.delete_range(lo.clone(), hi.clone());
                    tomb.ranges.push((lo.clone(), hi.clone()));
                }
            }
        }
        drop(tomb);
        self.top.apply(top_batch).await
    }

    async fn scan(&self, lo: &[u8], hi: &[u8]) -> Result<Vec<KvEntry>> {
        // Locks are released across this step (spec §4.1's "iteration
        // releases the lock across each user step"): we snapshot both
        // sources up front rather than holding the tombstone lock while the
        // caller processes results.
        let top_entries = self.top.scan(lo, hi).await?;
        let base_entries = self.base.scan(lo, hi).await?;
        let tomb_snapshot = {
            let t = self.tombstones.read().await;
            (t.points.clone(), t.ranges.clone())
        };

        let mut merged: std::collections::BTreeMap<Vec<u8>, Vec<u8>> = std::collections::BTreeMap::new();
        for (k, v) in base_entries {
            if !tomb_snapshot.0.contains(&k)
                && !tomb_snapshot.1.iter().any(|(lo, hi)| lo.as_slice() <= k.as_slice() && k.as_slice() <= hi.as_slice())
            {
                merged.insert(k, v);
            }
        }
        // top's keys win ties.
        for (k, v) in top_entries {
            merged.insert(k, v);
        }
        Ok(merged.into_iter().collect())
    }

    async fn lock(&self, name: &str) -> Result<LockGuard> {
        self.top.lock(name).await
    }

    async fn flush(&self) -> Result<()> {
        self.top.flush().await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    async fn base_with(pairs: &[(&str, &str)]) -> Arc<MemKv> {
        let base = Arc::new(MemKv::new());
        for (k, v) in pairs {
            base.set(k.as_bytes(), v.as_bytes()).await.unwrap();
        }
        base
    }

    #[tokio::test]
    async fn reads_prefer_top_then_base() {
        let base = base_with(&[("a", "1"), ("b", "2")]).await;
        let ov = Overlay::new(base);
        ov.set(b"b", b"20").await.unwrap();
        ov.set(b"c", b"3").await.unwrap();
        ov.delete(b"a").await.unwrap();

        assert_eq!(ov.get(b"a").await.unwrap(), None);
        assert_eq!(ov.get(b"b").await.unwrap(), Some(b"20".to_vec()));
        assert_eq!(ov.get(b"c").await.unwrap(), Some(b"3".to_vec()));
    }

    #[tokio::test]
    async fn scan_merges_and_suppresses_tombstones() {
        let base = base_with(&[("a", "1"), ("b", "2")]).await;
        let ov = Overlay::new(base);
        ov.set(b"b", b"20").await.unwrap();
        ov.delete(b"a").await.unwrap();
        ov.set(b"c", b"3").await.unwrap();

        let got = ov.scan(b"a", b"z").await.unwrap();
        assert_eq!(
            got,
            vec![(b"b".to_vec(), b"20".to_vec()), (b"c".to_vec(), b"3".to_vec())]
        );
    }

    #[tokio::test]
    async fn delete_range_suppresses_base_keys() {
        let base = base_with(&[("a", "1"), ("b", "2"), ("c", "3")]).await;
        let ov = Overlay::new(base);
        ov.delete_range(b"a", b"b").await.unwrap();
        let got = ov.scan(b"a", b"z").await.unwrap();
        assert_eq!(got, vec![(b"c".to_vec(), b"3".to_vec())]);
    }
}
