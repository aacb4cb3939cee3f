//! The single monotonic DBTime counter shared by every kind in a database,
//! and by the action log (spec §3: "unique per KV database", not per kind).

use oscar_base::{OscarError, Result};
use oscar_kv::{Kv, LockGuard};

use crate::timed::DbTime;

const CLOCK_LOCK: &str = "oscar.timed.clock";

pub fn clock_key() -> Vec<u8> {
    oscar_kv::encode(&[oscar_kv::Elem::str("__oscar_clock__")])
}

/// Reserves the next DBTime, holding the clock lock until the returned
/// guard is dropped. Callers must include `clock_key() -> next.to_be_bytes()`
/// in the same atomic batch that consumes this reservation, so the counter
/// and the caller's writes become visible together.
pub async fn reserve<K: Kv>(kv: &K) -> Result<(LockGuard, DbTime)> {
    let guard = kv.lock(CLOCK_LOCK).await?;
    let next = match kv.get(&clock_key()).await? {
        Some(bytes) => {
            let cur = DbTime::from_be_bytes(
                bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| OscarError::storage("corrupt clock row"))?,
            );
            cur + 1
        }
        None => 1,
    };
    Ok((guard, next))
}
