//! The durable action log (spec §4.4).

use dashmap::DashMap;
use oscar_base::{OscarError, Result, WallNanos};
use oscar_kv::{decode, Batch, Elem, Kv};
use oscar_timed::{clock, DbTime};
use std::sync::Arc;

use crate::policy::PolicyVerdict;
use crate::registry::Actioner;
use crate::types::{ActionEntry, Decision, StoredEntry};

const KIND: &str = "action.Log";
const WALLCLOCK_KIND: &str = "action.Wallclock";

pub(crate) fn by_key_row_key(namespace: &str, user_key: &[u8], unique: u64) -> Vec<u8> {
    oscar_kv::encode(&[
        Elem::str(KIND),
        Elem::str("ByKey"),
        Elem::str(namespace),
        Elem::bytes(user_key.to_vec()),
        Elem::U64(unique),
    ])
}

fn by_key_prefix_lo(namespace: &str, user_key: &[u8]) -> Vec<u8> {
    oscar_kv::encode(&[Elem::str(KIND), Elem::str("ByKey"), Elem::str(namespace), Elem::bytes(user_key.to_vec())])
}

fn by_key_prefix_hi(namespace: &str, user_key: &[u8]) -> Vec<u8> {
    oscar_kv::encode(&[
        Elem::str(KIND),
        Elem::str("ByKey"),
        Elem::str(namespace),
        Elem::bytes(user_key.to_vec()),
        Elem::PosInfinity,
    ])
}

fn by_key_full_lo() -> Vec<u8> {
    oscar_kv::encode(&[Elem::str(KIND), Elem::str("ByKey")])
}

fn by_key_full_hi() -> Vec<u8> {
    oscar_kv::encode(&[Elem::str(KIND), Elem::str("ByKey"), Elem::PosInfinity])
}

fn by_time_row_key(t: DbTime, namespace: &str, user_key: &[u8], unique: u64) -> Vec<u8> {
    oscar_kv::encode(&[
        Elem::str(KIND),
        Elem::str("ByTime"),
        Elem::I64(t),
        Elem::str(namespace),
        Elem::bytes(user_key.to_vec()),
        Elem::U64(unique),
    ])
}

fn by_time_lo(after_exclusive: DbTime) -> Vec<u8> {
    oscar_kv::encode(&[Elem::str(KIND), Elem::str("ByTime"), Elem::I64(after_exclusive.saturating_add(1))])
}

fn by_time_hi() -> Vec<u8> {
    oscar_kv::encode(&[Elem::str(KIND), Elem::str("ByTime"), Elem::PosInfinity])
}

fn wallclock_row_key(wall: WallNanos, t: DbTime) -> Vec<u8> {
    oscar_kv::encode(&[Elem::str(WALLCLOCK_KIND), Elem::I64(wall), Elem::I64(t)])
}

fn wallclock_lo(after_wall_inclusive: WallNanos) -> Vec<u8> {
    oscar_kv::encode(&[Elem::str(WALLCLOCK_KIND), Elem::I64(after_wall_inclusive)])
}

fn wallclock_hi() -> Vec<u8> {
    oscar_kv::encode(&[Elem::str(WALLCLOCK_KIND), Elem::PosInfinity])
}

pub(crate) fn entry_lock_name(namespace: &str, user_key: &[u8], unique: u64) -> String {
    format!(
        "oscar.action.entry.{namespace}.{}.{unique}",
        user_key.iter().map(|b| format!("{b:02x}")).collect::<String>()
    )
}

/// The durable action log over one `Kv`. Namespaces are registered once at
/// startup (spec §4.5) and stay stable for the process's lifetime.
pub struct ActionLog<K: Kv> {
    pub(crate) kv: Arc<K>,
    pub(crate) registry: DashMap<String, Arc<dyn Actioner>>,
}

/// The closure-equivalent returned by `register`: the only way to append
/// entries for this namespace (spec §4.4).
pub struct ActionerHandle<K: Kv> {
    log: Arc<ActionLog<K>>,
    namespace: String,
}

impl<K: Kv> ActionerHandle<K> {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Creates an entry under `(namespace, user_key)`. Returns `true` if
    /// newly created, `false` if one already existed (idempotent re-entry).
    pub async fn before(&self, user_key: &[u8], action: &[u8], approval_required: bool) -> Result<bool> {
        self.log.before(&self.namespace, user_key, action, approval_required).await
    }
}

impl<K: Kv> ActionLog<K> {
    pub fn new(kv: Arc<K>) -> Arc<Self> {
        Arc::new(ActionLog {
            kv,
            registry: DashMap::new(),
        })
    }

    /// Associates an actioner with a namespace. Fails if the namespace is
    /// already registered (spec §4.4).
    pub fn register(self: &Arc<Self>, namespace: &str, actioner: Arc<dyn Actioner>) -> Result<ActionerHandle<K>> {
        if self.registry.contains_key(namespace) {
            return Err(OscarError::fatal(format!("namespace already registered: {namespace}")));
        }
        self.registry.insert(namespace.to_string(), actioner);
        Ok(ActionerHandle {
            log: self.clone(),
            namespace: namespace.to_string(),
        })
    }

    pub(crate) fn actioner_for(&self, namespace: &str) -> Option<Arc<dyn Actioner>> {
        self.registry.get(namespace).map(|e| e.value().clone())
    }

    async fn find_existing(&self, namespace: &str, user_key: &[u8]) -> Result<Option<StoredEntry>> {
        let rows = self
            .kv
            .scan(&by_key_prefix_lo(namespace, user_key), &by_key_prefix_hi(namespace, user_key))
            .await?;
        match rows.into_iter().next() {
            Some((_, val)) => Ok(Some(StoredEntry::decode(&val)?)),
            None => Ok(None),
        }
    }

    async fn before(&self, namespace: &str, user_key: &[u8], action: &[u8], approval_required: bool) -> Result<bool> {
        if !self.registry.contains_key(namespace) {
            return Err(OscarError::fatal(format!("Before called for unregistered namespace: {namespace}")));
        }
        let lock_name = format!(
            "oscar.action.before.{namespace}.{}",
            user_key.iter().map(|b| format!("{b:02x}")).collect::<String>()
        );
        let _guard = self.kv.lock(&lock_name).await?;
        if self.find_existing(namespace, user_key).await?.is_some() {
            return Ok(false);
        }

        let unique: u64 = rand::random();
        let (clock_guard, t) = clock::reserve(self.kv.as_ref()).await?;
        let created = wall_now();
        let entry = ActionEntry {
            created,
            done: 0,
            mod_time: t,
            namespace: namespace.to_string(),
            key: user_key.to_vec(),
            unique,
            action: action.to_vec(),
            result: Vec::new(),
            error: String::new(),
            approval_required,
            decisions: Vec::new(),
            policy_verdicts: Vec::new(),
        };
        let stored = StoredEntry::new(entry);

        let mut batch = Batch::new();
        batch.set(clock::clock_key(), t.to_be_bytes().to_vec());
        batch.set(by_key_row_key(namespace, user_key, unique), stored.encode()?);
        batch.set(by_time_row_key(t, namespace, user_key, unique), Vec::new());
        batch.set(wallclock_row_key(created, t), Vec::new());
        self.kv.apply(batch).await?;
        drop(clock_guard);
        tracing::info!(target: "oscar.action", namespace, unique, t, "action recorded");
        Ok(true)
    }

    /// Appends an approval record. Fails loudly if the entry does not exist,
    /// does not require approval, or has already completed.
    pub async fn add_decision(&self, namespace: &str, user_key: &[u8], unique: u64, decision: Decision) -> Result<()> {
        let key = by_key_row_key(namespace, user_key, unique);
        let _guard = self.kv.lock(&entry_lock_name(namespace, user_key, unique)).await?;
        let mut stored = self
            .kv
            .get(&key)
            .await?
            .map(|v| StoredEntry::decode(&v))
            .transpose()?
            .ok_or_else(|| OscarError::fatal("AddDecision on entry that does not exist"))?;
        if stored.value.is_done() {
            return Err(OscarError::fatal("AddDecision on entry that has already completed"));
        }
        if !stored.value.approval_required {
            return Err(OscarError::fatal("AddDecision on entry that does not require approval"));
        }
        stored.value.decisions.push(decision);
        self.kv.set(&key, &stored.encode()?).await?;
        Ok(())
    }

    /// Marks an entry done, recording its result or error. Called exactly
    /// once per entry by the runner (spec §7: double completion is fatal).
    pub(crate) async fn complete_entry(
        &self,
        namespace: &str,
        user_key: &[u8],
        unique: u64,
        result: Vec<u8>,
        error: String,
        verdicts: Vec<PolicyVerdict>,
    ) -> Result<()> {
        let key = by_key_row_key(namespace, user_key, unique);
        let _guard = self.kv.lock(&entry_lock_name(namespace, user_key, unique)).await?;
        let mut stored = self
            .kv
            .get(&key)
            .await?
            .map(|v| StoredEntry::decode(&v))
            .transpose()?
            .ok_or_else(|| OscarError::fatal("completing an entry that does not exist"))?;
        if stored.value.is_done() {
            return Err(OscarError::fatal("double completion of an action log entry"));
        }
        stored.value.done = wall_now();
        stored.value.result = result;
        stored.value.error = error;
        stored.value.policy_verdicts = verdicts;
        self.kv.set(&key, &stored.encode()?).await?;
        Ok(())
    }

    /// Records a transient failure message without marking the entry done,
    /// leaving it eligible for the next `Run` (spec §7).
    pub(crate) async fn record_transient_error(
        &self,
        namespace: &str,
        user_key: &[u8],
        unique: u64,
        error: String,
    ) -> Result<()> {
        let key = by_key_row_key(namespace, user_key, unique);
        let _guard = self.kv.lock(&entry_lock_name(namespace, user_key, unique)).await?;
        let mut stored = self
            .kv
            .get(&key)
            .await?
            .map(|v| StoredEntry::decode(&v))
            .transpose()?
            .ok_or_else(|| OscarError::fatal("recording a transient error on an entry that does not exist"))?;
        if stored.value.is_done() {
            return Err(OscarError::fatal("transient error recorded on an entry that has already completed"));
        }
        stored.value.error = error;
        self.kv.set(&key, &stored.encode()?).await?;
        Ok(())
    }

    pub async fn get(&self, namespace: &str, user_key: &[u8], unique: u64) -> Result<Option<ActionEntry>> {
        match self.kv.get(&by_key_row_key(namespace, user_key, unique)).await? {
            Some(bytes) => Ok(Some(StoredEntry::decode(&bytes)?.value)),
            None => Ok(None),
        }
    }

    /// Entries in key order (namespace, then userKey, then unique).
    pub async fn scan(&self, lo: Option<&str>, hi: Option<&str>) -> Result<Vec<ActionEntry>> {
        let lo_key = lo
            .map(|ns| oscar_kv::encode(&[Elem::str(KIND), Elem::str("ByKey"), Elem::str(ns)]))
            .unwrap_or_else(by_key_full_lo);
        let hi_key = hi
            .map(|ns| oscar_kv::encode(&[Elem::str(KIND), Elem::str("ByKey"), Elem::str(ns), Elem::PosInfinity]))
            .unwrap_or_else(by_key_full_hi);
        let rows = self.kv.scan(&lo_key, &hi_key).await?;
        rows.into_iter().map(|(_, v)| Ok(StoredEntry::decode(&v)?.value)).collect()
    }

    /// Entries in DBTime order for DBTimes strictly greater than `after`.
    /// `filter` (if given) is evaluated against the raw (namespace, userKey)
    /// pair from the index row before the data row is fetched.
    pub async fn scan_after(
        &self,
        after: DbTime,
        filter: Option<&(dyn Fn(&str, &[u8]) -> bool + Send + Sync)>,
    ) -> Result<Vec<ActionEntry>> {
        let index_rows = self.kv.scan(&by_time_lo(after), &by_time_hi()).await?;
        let mut out = Vec::with_capacity(index_rows.len());
        for (key, _) in index_rows {
            let (t, namespace, user_key, unique) = decode_by_time_key(&key)?;
            if let Some(f) = filter {
                if !f(&namespace, &user_key) {
                    continue;
                }
            }
            if let Some(entry) = self.get(&namespace, &user_key, unique).await? {
                if entry.mod_time == t {
                    out.push(entry);
                }
            }
        }
        out.sort_by_key(|e| e.mod_time);
        Ok(out)
    }

    /// Like `scan_after`, but the bound is a wall-clock time rather than a
    /// DBTime: uses the wallclock index to find the first DBTime whose wall
    /// time is `>= after_wall` (inclusive lower bound — spec §9's open
    /// question, resolved here), then delegates to `scan_after`.
    pub async fn scan_after_wall(
        &self,
        after_wall: WallNanos,
        filter: Option<&(dyn Fn(&str, &[u8]) -> bool + Send + Sync)>,
    ) -> Result<Vec<ActionEntry>> {
        let rows = self.kv.scan(&wallclock_lo(after_wall), &wallclock_hi()).await?;
        let first_t = match rows.into_iter().next() {
            Some((key, _)) => decode_wallclock_key(&key)?.1,
            None => return Ok(Vec::new()),
        };
        self.scan_after(first_t - 1, filter).await
    }
}

fn wall_now() -> WallNanos {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as WallNanos)
        .unwrap_or(0)
}

fn decode_by_time_key(key: &[u8]) -> Result<(DbTime, String, Vec<u8>, u64)> {
    let elems = decode(key).map_err(|e| OscarError::storage(e.to_string()))?;
    match elems.as_slice() {
        [Elem::Str(_), Elem::Str(tag), Elem::I64(t), Elem::Str(ns), Elem::Bytes(uk), Elem::U64(unique)] if tag == "ByTime" => {
            Ok((*t, ns.clone(), uk.clone(), *unique))
        }
        _ => Err(OscarError::storage("corrupt action log ByTime row key")),
    }
}

fn decode_wallclock_key(key: &[u8]) -> Result<(WallNanos, DbTime)> {
    let elems = decode(key).map_err(|e| OscarError::storage(e.to_string()))?;
    match elems.as_slice() {
        [Elem::Str(_), Elem::I64(wall), Elem::I64(t)] => Ok((*wall, *t)),
        _ => Err(OscarError::storage("corrupt wallclock row key")),
    }
}
