//! The timed per-kind index (spec §4.3): a monotonic logical clock layered
//! over `oscar_kv::Kv`, with atomic data-row/index-row pairs and resumable
//! scans by DBTime.

use oscar_base::{OscarError, Result};
use oscar_kv::{decode, Batch, Elem, Kv};
use std::sync::Arc;

use crate::clock;

/// Logical time: strictly monotone, unique across the whole database.
pub type DbTime = i64;

fn data_key(kind: &str, data_key: &[u8]) -> Vec<u8> {
    oscar_kv::encode(&[Elem::str(kind), Elem::str("ByKey"), Elem::bytes(data_key.to_vec())])
}

fn index_key(kind: &str, t: DbTime, data_key: &[u8]) -> Vec<u8> {
    oscar_kv::encode(&[
        Elem::str(kind),
        Elem::str("ByTime"),
        Elem::I64(t),
        Elem::bytes(data_key.to_vec()),
    ])
}

fn index_lo(kind: &str, after_exclusive: DbTime) -> Vec<u8> {
    oscar_kv::encode(&[Elem::str(kind), Elem::str("ByTime"), Elem::I64(after_exclusive.saturating_add(1))])
}

fn index_hi(kind: &str) -> Vec<u8> {
    oscar_kv::encode(&[Elem::str(kind), Elem::str("ByTime"), Elem::PosInfinity])
}

fn row_lo(kind: &str, lo: &[u8]) -> Vec<u8> {
    oscar_kv::encode(&[Elem::str(kind), Elem::str("ByKey"), Elem::bytes(lo.to_vec())])
}

fn row_hi(kind: &str, hi: &[u8]) -> Vec<u8> {
    oscar_kv::encode(&[Elem::str(kind), Elem::str("ByKey"), Elem::bytes(hi.to_vec())])
}

fn encode_value_row(t: DbTime, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + value.len());
    out.extend_from_slice(&t.to_be_bytes());
    out.extend_from_slice(value);
    out
}

fn decode_value_row(bytes: &[u8]) -> Result<(DbTime, Vec<u8>)> {
    if bytes.len() < 8 {
        return Err(OscarError::storage("timed value row shorter than 8 bytes"));
    }
    let t = DbTime::from_be_bytes(bytes[..8].try_into().unwrap());
    Ok((t, bytes[8..].to_vec()))
}

/// One entry yielded by a timed scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedEntry {
    pub time: DbTime,
    pub data_key: Vec<u8>,
    pub value: Vec<u8>,
}

pub struct TimedIndex<K: Kv> {
    kv: Arc<K>,
}

impl<K: Kv> TimedIndex<K> {
    pub fn new(kv: Arc<K>) -> Self {
        TimedIndex { kv }
    }

    pub fn kv(&self) -> &Arc<K> {
        &self.kv
    }

    /// Atomically assigns the next DBTime and writes the data/index row pair
    /// for `(kind, data_key)`, removing the previous index row if one
    /// existed. Returns the assigned DBTime.
    pub async fn set(&self, kind: &str, data_key_bytes: &[u8], value: &[u8]) -> Result<DbTime> {
        let (_guard, t) = clock::reserve(self.kv.as_ref()).await?;

        let dk = data_key(kind, data_key_bytes);
        let previous = self.kv.get(&dk).await?;

        let mut batch = Batch::new();
        batch.set(clock::clock_key(), t.to_be_bytes().to_vec());
        batch.set(dk, encode_value_row(t, value));
        batch.set(index_key(kind, t, data_key_bytes), Vec::new());
        if let Some(prev_bytes) = previous {
            let (prev_t, _) = decode_value_row(&prev_bytes)?;
            batch.delete(index_key(kind, prev_t, data_key_bytes));
        }
        self.kv.apply(batch).await?;
        tracing::debug!(target: "oscar.timed", kind, t, "timed set");
        Ok(t)
    }

    pub async fn get(&self, kind: &str, data_key_bytes: &[u8]) -> Result<Option<(DbTime, Vec<u8>)>> {
        match self.kv.get(&data_key(kind, data_key_bytes)).await? {
            Some(bytes) => Ok(Some(decode_value_row(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Entries in data-key order over `[lo, hi]`.
    pub async fn scan(&self, kind: &str, lo: &[u8], hi: &[u8]) -> Result<Vec<TimedEntry>> {
        let rows = self.kv.scan(&row_lo(kind, lo), &row_hi(kind, hi)).await?;
        let mut out = Vec::with_capacity(rows.len());
        for (key, val) in rows {
            let (_, _, dk) = decode_by_key(&key)?;
            let (t, value) = decode_value_row(&val)?;
            out.push(TimedEntry { time: t, data_key: dk, value });
        }
        Ok(out)
    }

    /// Entries in DBTime order for DBTimes strictly greater than `after`.
    /// When `filter` returns false for a data key, that entry is skipped
    /// without fetching its data row.
    pub async fn scan_after(
        &self,
        kind: &str,
        after: DbTime,
        filter: Option<&(dyn Fn(&[u8]) -> bool + Send + Sync)>,
    ) -> Result<Vec<TimedEntry>> {
        let index_rows = self.kv.scan(&index_lo(kind, after), &index_hi(kind)).await?;
        let mut out = Vec::with_capacity(index_rows.len());
        for (key, _) in index_rows {
            let (t, dk) = decode_by_time(&key)?;
            if let Some(f) = filter {
                if !f(&dk) {
                    continue;
                }
            }
            match self.get(kind, &dk).await? {
                Some((cur_t, value)) if cur_t == t => out.push(TimedEntry { time: t, data_key: dk, value }),
                // The data row has since moved to a newer DBTime (a later
                // `set` overwrote it) or was removed entirely; this index
                // row is stale and is skipped rather than yielded twice.
                _ => {}
            }
        }
        out.sort_by_key(|e| e.time);
        Ok(out)
    }
}

fn decode_by_key(key: &[u8]) -> Result<(String, String, Vec<u8>)> {
    let elems = decode(key).map_err(|e| OscarError::storage(e.to_string()))?;
    match elems.as_slice() {
        [Elem::Str(kind), Elem::Str(tag), Elem::Bytes(dk)] if tag == "ByKey" => {
            Ok((kind.clone(), tag.clone(), dk.clone()))
        }
        _ => Err(OscarError::storage("corrupt ByKey row key")),
    }
}

fn decode_by_time(key: &[u8]) -> Result<(DbTime, Vec<u8>)> {
    let elems = decode(key).map_err(|e| OscarError::storage(e.to_string()))?;
    match elems.as_slice() {
        [Elem::Str(_), Elem::Str(tag), Elem::I64(t), Elem::Bytes(dk)] if tag == "ByTime" => Ok((*t, dk.clone())),
        _ => Err(OscarError::storage("corrupt ByTime row key")),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use oscar_kv::MemKv;

    fn idx() -> TimedIndex<MemKv> {
        TimedIndex::new(Arc::new(MemKv::new()))
    }

    #[tokio::test]
    async fn dbtimes_strictly_increase() {
        let t = idx();
        let t1 = t.set("k", b"a", b"v1").await.unwrap();
        let t2 = t.set("k", b"b", b"v2").await.unwrap();
        let t3 = t.set("k", b"a", b"v3").await.unwrap();
        assert!(t1 < t2 && t2 < t3);
    }

    #[tokio::test]
    async fn index_consistency_after_overwrite() {
        let t = idx();
        t.set("k", b"a", b"v1").await.unwrap();
        let t2 = t.set("k", b"a", b"v2").await.unwrap();
        let all = t.scan_after("k", 0, None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].time, t2);
        assert_eq!(all[0].value, b"v2");
    }

    #[tokio::test]
    async fn scan_after_orders_by_dbtime() {
        let t = idx();
        t.set("k", b"b", b"2").await.unwrap();
        t.set("k", b"a", b"1").await.unwrap();
        let all = t.scan_after("k", 0, None).await.unwrap();
        assert_eq!(all.iter().map(|e| e.data_key.clone()).collect::<Vec<_>>(), vec![b"b".to_vec(), b"a".to_vec()]);
    }

    #[tokio::test]
    async fn scan_by_data_key_order() {
        let t = idx();
        t.set("k", b"b", b"2").await.unwrap();
        t.set("k", b"a", b"1").await.unwrap();
        let all = t.scan("k", b"", &[0xff; 16]).await.unwrap();
        assert_eq!(all.iter().map(|e| e.data_key.clone()).collect::<Vec<_>>(), vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[tokio::test]
    async fn filter_skips_without_fetching() {
        let t = idx();
        t.set("k", b"a", b"1").await.unwrap();
        t.set("k", b"b", b"2").await.unwrap();
        let filtered = t
            .scan_after("k", 0, Some(&|dk: &[u8]| dk != b"a"))
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].data_key, b"b");
    }

    #[tokio::test]
    async fn independent_kinds_do_not_interfere() {
        let t = idx();
        t.set("kind1", b"a", b"1").await.unwrap();
        t.set("kind2", b"a", b"2").await.unwrap();
        assert_eq!(t.scan_after("kind1", 0, None).await.unwrap().len(), 1);
        assert_eq!(t.scan_after("kind2", 0, None).await.unwrap().len(), 1);
    }
}
