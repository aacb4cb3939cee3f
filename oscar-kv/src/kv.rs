//! The abstract ordered KV contract (spec §4.1).

use async_trait::async_trait;
use oscar_base::Result;

/// A single `(key, value)` pair returned from a scan. Values are copied out
/// eagerly here (unlike a zero-copy cursor) because both concrete backends
/// (`MemKv`, `RedbKv`) already hold owned bytes by the time a scan step
/// completes; callers that want to retain a key or value across iteration
/// steps get an owned `Vec<u8>` for free.
pub type KvEntry = (Vec<u8>, Vec<u8>);

/// A batch of writes applied atomically by `Kv::apply`.
#[derive(Debug, Default, Clone)]
pub struct Batch {
    pub(crate) ops: Vec<Op>,
}

#[derive(Debug, Clone)]
pub(crate) enum Op {
    Set(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
    DeleteRange(Vec<u8>, Vec<u8>),
}

impl Batch {
    pub fn new() -> Self {
        Batch::default()
    }

    pub fn set(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(Op::Set(key.into(), value.into()));
        self
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(Op::Delete(key.into()));
        self
    }

    pub fn delete_range(&mut self, lo: impl Into<Vec<u8>>, hi: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(Op::DeleteRange(lo.into(), hi.into()));
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// An advisory, process-wide, non-reentrant lock handle. Dropping it
/// releases the lock; callers needing an explicit release point call
/// `unlock` (equivalent to `drop`, kept for symmetry with the spec's
/// `Lock`/`Unlock` pair).
pub struct LockGuard {
    pub(crate) _permit: Box<dyn Send + Sync>,
}

impl LockGuard {
    pub fn unlock(self) {
        drop(self);
    }
}

/// Ordered key-value substrate contract (spec §4.1).
///
/// Implementations must provide atomic batch application, ascending-order
/// range scans, and process-wide advisory locks. `MaybeApply`-style early
/// commit is expressed as `apply_maybe`, returning whether it actually
/// flushed, so callers bounding memory in a big loop can react.
#[async_trait]
pub trait Kv: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    async fn apply(&self, batch: Batch) -> Result<()>;

    /// Ascending-order scan over `[lo, hi]` inclusive on both ends.
    async fn scan(&self, lo: &[u8], hi: &[u8]) -> Result<Vec<KvEntry>>;

    async fn lock(&self, name: &str) -> Result<LockGuard>;

    async fn flush(&self) -> Result<()>;

    fn panic(&self, msg: &str) -> ! {
        tracing::error!(target: "oscar.kv", "panic: {msg}");
        panic!("oscar-kv: {msg}");
    }

    async fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut b = Batch::new();
        b.set(key.to_vec(), value.to_vec());
        self.apply(b).await
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        let mut b = Batch::new();
        b.delete(key.to_vec());
        self.apply(b).await
    }

    async fn delete_range(&self, lo: &[u8], hi: &[u8]) -> Result<()> {
        let mut b = Batch::new();
        b.delete_range(lo.to_vec(), hi.to_vec());
        self.apply(b).await
    }
}

/// Bound on the number of buffered ops before `BatchAccumulator::maybe_apply`
/// flushes early, mirroring spec §4.1's `MaybeApply`.
pub const MAYBE_APPLY_THRESHOLD: usize = 512;

/// Helper for callers building up a batch across a large loop, applying it
/// early once it crosses `MAYBE_APPLY_THRESHOLD` ops.
pub struct BatchAccumulator {
    batch: Batch,
}

impl BatchAccumulator {
    pub fn new() -> Self {
        BatchAccumulator { batch: Batch::new() }
    }

    pub fn batch_mut(&mut self) -> &mut Batch {
        &mut self.batch
    }

    /// Applies and clears the batch if it has grown past the threshold.
    /// Returns whether it did so.
    pub async fn maybe_apply(&mut self, kv: &dyn Kv) -> Result<bool> {
        if self.batch.len() >= MAYBE_APPLY_THRESHOLD {
            let batch = std::mem::take(&mut self.batch);
            kv.apply(batch).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub async fn finish(mut self, kv: &dyn Kv) -> Result<()> {
        if !self.batch.is_empty() {
            kv.apply(std::mem::take(&mut self.batch)).await?;
        }
        Ok(())
    }
}

impl Default for BatchAccumulator {
    fn default() -> Self {
        Self::new()
    }
}
