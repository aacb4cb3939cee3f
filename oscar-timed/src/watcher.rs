//! Named, persisted cursors over a timed kind (spec §4.3).

use oscar_base::{OscarError, Result};
use oscar_kv::{Elem, Kv, LockGuard};
use std::sync::Arc;

use crate::timed::{DbTime, TimedEntry, TimedIndex};

fn cursor_key(kind: &str, name: &str) -> Vec<u8> {
    oscar_kv::encode(&[Elem::str("watcher"), Elem::str(kind), Elem::str(name)])
}

fn lock_name(kind: &str, name: &str) -> String {
    format!("oscar.watcher.{kind}.{name}")
}

/// A named cursor over `kind`, providing at-least-once delivery of unseen
/// entries. Multiple processes may share a name; `MarkOld` calls race and
/// compose via `max`.
pub struct Watcher<K: Kv> {
    timed: Arc<TimedIndex<K>>,
    kind: String,
    name: String,
}

impl<K: Kv> Watcher<K> {
    pub fn new(timed: Arc<TimedIndex<K>>, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Watcher {
            timed,
            kind: kind.into(),
            name: name.into(),
        }
    }

    async fn read_mark(&self) -> Result<DbTime> {
        match self.timed.kv().get(&cursor_key(&self.kind, &self.name)).await? {
            Some(bytes) => Ok(DbTime::from_be_bytes(
                bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| OscarError::storage("corrupt watcher cursor"))?,
            )),
            None => Ok(0),
        }
    }

    async fn write_mark(&self, t: DbTime) -> Result<()> {
        self.timed
            .kv()
            .set(&cursor_key(&self.kind, &self.name), &t.to_be_bytes())
            .await
    }

    /// The cursor's current value, outside of an active `recent()` session.
    pub async fn mark(&self) -> Result<DbTime> {
        self.read_mark().await
    }

    /// Opens a `Recent` iteration session: acquires the per-watcher lock for
    /// the session's lifetime and snapshots every entry with DBTime greater
    /// than the current mark.
    pub async fn recent(&self) -> Result<RecentSession<'_, K>> {
        let guard = self.timed.kv().lock(&lock_name(&self.kind, &self.name)).await?;
        let mark = self.read_mark().await?;
        let entries = self.timed.scan_after(&self.kind, mark, None).await?;
        Ok(RecentSession {
            watcher: self,
            _guard: guard,
            mark,
            entries,
        })
    }

    /// Resets the cursor to zero ("from the beginning").
    pub async fn restart(&self) -> Result<()> {
        let _guard = self.timed.kv().lock(&lock_name(&self.kind, &self.name)).await?;
        self.write_mark(0).await
    }
}

/// An in-progress `Recent` iteration. Holds the watcher's lock until
/// dropped, so `mark_old` calls from this session and any concurrent
/// `recent()`/`restart()` call on the same watcher name never interleave.
pub struct RecentSession<'w, K: Kv> {
    watcher: &'w Watcher<K>,
    _guard: LockGuard,
    mark: DbTime,
    entries: Vec<TimedEntry>,
}

impl<'w, K: Kv> RecentSession<'w, K> {
    pub fn entries(&self) -> &[TimedEntry] {
        &self.entries
    }

    /// Advances the cursor to `max(current, t)`. Only meaningful while this
    /// session is alive — the lock it holds is what makes concurrent
    /// `MarkOld` calls from racing consumers compose safely via `max`
    /// instead of clobbering each other.
    pub async fn mark_old(&mut self, t: DbTime) -> Result<()> {
        self.mark = self.mark.max(t);
        self.watcher.write_mark(self.mark).await
    }

    /// Persists the cursor. Both backends in this workspace write the
    /// cursor durably on every `mark_old`, so this is a no-op kept for
    /// symmetry with spec §4.3's `Flush()` and for backends that might
    /// buffer cursor writes.
    pub async fn flush(&self) -> Result<()> {
        self.watcher.timed.kv().flush().await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use oscar_kv::MemKv;

    fn setup() -> Arc<TimedIndex<MemKv>> {
        Arc::new(TimedIndex::new(Arc::new(MemKv::new())))
    }

    #[tokio::test]
    async fn at_least_once_until_marked() {
        let timed = setup();
        let t1 = timed.set("k", b"x", b"1").await.unwrap();
        let t2 = timed.set("k", b"y", b"2").await.unwrap();
        let w = Watcher::new(timed.clone(), "k", "w1");

        {
            let s = w.recent().await.unwrap();
            assert_eq!(s.entries().len(), 2);
        }
        // Without marking, a second Recent still yields both.
        {
            let s = w.recent().await.unwrap();
            assert_eq!(s.entries().iter().map(|e| e.time).collect::<Vec<_>>(), vec![t1, t2]);
        }
    }

    #[tokio::test]
    async fn mark_old_advances_cursor_and_excludes_older() {
        let timed = setup();
        let t1 = timed.set("k", b"x", b"1").await.unwrap();
        let _t2 = timed.set("k", b"y", b"2").await.unwrap();
        let w = Watcher::new(timed.clone(), "k", "w1");

        {
            let mut s = w.recent().await.unwrap();
            s.mark_old(t1).await.unwrap();
        }
        let s = w.recent().await.unwrap();
        assert_eq!(s.entries().len(), 1);
        assert_eq!(s.entries()[0].data_key, b"y");
    }

    #[tokio::test]
    async fn mark_old_composes_via_max() {
        let timed = setup();
        let t1 = timed.set("k", b"x", b"1").await.unwrap();
        let t2 = timed.set("k", b"y", b"2").await.unwrap();
        let w = Watcher::new(timed.clone(), "k", "w1");

        let mut s = w.recent().await.unwrap();
        s.mark_old(t2).await.unwrap();
        s.mark_old(t1).await.unwrap(); // lower value must not regress the mark
        drop(s);
        assert_eq!(w.mark().await.unwrap(), t2);
    }

    #[tokio::test]
    async fn restart_resets_to_beginning() {
        let timed = setup();
        let t1 = timed.set("k", b"x", b"1").await.unwrap();
        let w = Watcher::new(timed.clone(), "k", "w1");
        {
            let mut s = w.recent().await.unwrap();
            s.mark_old(t1).await.unwrap();
        }
        w.restart().await.unwrap();
        let s = w.recent().await.unwrap();
        assert_eq!(s.entries().len(), 1);
    }

    #[tokio::test]
    async fn independent_watcher_names_have_independent_cursors() {
        let timed = setup();
        let t1 = timed.set("k", b"x", b"1").await.unwrap();
        let w1 = Watcher::new(timed.clone(), "k", "a");
        let w2 = Watcher::new(timed.clone(), "k", "b");
        {
            let mut s = w1.recent().await.unwrap();
            s.mark_old(t1).await.unwrap();
        }
        assert_eq!(w1.recent().await.unwrap().entries().len(), 0);
        assert_eq!(w2.recent().await.unwrap().entries().len(), 1);
    }
}
