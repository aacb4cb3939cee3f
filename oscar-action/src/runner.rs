//! Serialized dispatch of approved, undone action log entries to their
//! registered actioners (spec §4.4 `Run`, §5 locking discipline).

use std::sync::Arc;

use oscar_base::{OscarError, Result};
use oscar_kv::Kv;
use oscar_timed::DbTime;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::log::{entry_lock_name, ActionLog};
use crate::policy::PolicyChecker;
use crate::registry::{ActionError, Actioner};
use crate::types::ActionEntry;

fn namespace_lock_name(namespace: &str) -> String {
    format!("oscar.action.namespace.{namespace}")
}

/// Tunables for `Runner::run` (spec §9 open question, resolved in
/// SPEC_FULL §2a: sequential by default, concurrency is opt-in).
#[derive(Clone)]
pub struct RunnerConfig {
    /// Number of entries dispatched concurrently. `1` (the default) matches
    /// the reference sequential behavior.
    pub concurrency: usize,
    /// When set, every terminal failure is also logged at `warn` level with
    /// a dead-letter marker, so log aggregation can alert on it without a
    /// separate storage kind.
    pub dead_letter_terminal_failures: bool,
    /// Optional policy hook (spec §6). When set, a successful actioner
    /// result is checked before the entry is marked done; any disallowed
    /// verdict turns the outcome into a terminal failure.
    pub policy: Option<Arc<dyn PolicyChecker>>,
}

impl std::fmt::Debug for RunnerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerConfig")
            .field("concurrency", &self.concurrency)
            .field("dead_letter_terminal_failures", &self.dead_letter_terminal_failures)
            .field("policy", &self.policy.is_some())
            .finish()
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            concurrency: 1,
            dead_letter_terminal_failures: false,
            policy: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Succeeded,
    TerminalFailure,
    TransientFailure,
    SkippedNotApproved,
    SkippedDone,
}

/// Tally returned by one `run` call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub dispatched: usize,
    pub succeeded: usize,
    pub terminal_failures: usize,
    pub transient_failures: usize,
    pub skipped: usize,
    /// Highest `ModTime` among entries this pass considered, regardless of
    /// outcome — callers driving a loop use this to advance their `after`
    /// cursor so already-done entries stop being rescanned.
    pub max_dbtime: DbTime,
}

impl RunSummary {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Succeeded => {
                self.dispatched += 1;
                self.succeeded += 1;
            }
            Outcome::TerminalFailure => {
                self.dispatched += 1;
                self.terminal_failures += 1;
            }
            Outcome::TransientFailure => {
                self.dispatched += 1;
                self.transient_failures += 1;
            }
            Outcome::SkippedNotApproved | Outcome::SkippedDone => {
                self.skipped += 1;
            }
        }
    }
}

pub struct Runner<K: Kv> {
    log: Arc<ActionLog<K>>,
    config: RunnerConfig,
}

impl<K: Kv + 'static> Runner<K> {
    pub fn new(log: Arc<ActionLog<K>>, config: RunnerConfig) -> Self {
        Runner { log, config }
    }

    /// Dispatches every entry in DBTime order after `after` that is
    /// `!Done && approved`. Sequential when `concurrency == 1`; otherwise
    /// fans out up to `concurrency` dispatches at once, still honoring the
    /// entry-lock → namespace-lock → domain-lock order inside each
    /// dispatch (spec §5).
    pub async fn run(&self, after: DbTime, cancel: &CancellationToken) -> Result<RunSummary> {
        let entries = self.log.scan_after(after, None).await?;
        let mut summary = RunSummary::default();

        if self.config.concurrency <= 1 {
            for entry in entries {
                if cancel.is_cancelled() {
                    break;
                }
                summary.max_dbtime = summary.max_dbtime.max(entry.mod_time);
                let outcome = dispatch_entry(
                    &self.log,
                    entry,
                    self.config.dead_letter_terminal_failures,
                    self.config.policy.clone(),
                )
                .await?;
                summary.record(outcome);
            }
            return Ok(summary);
        }

        let sem = Arc::new(Semaphore::new(self.config.concurrency));
        let mut handles = Vec::with_capacity(entries.len());
        for entry in entries {
            if cancel.is_cancelled() {
                break;
            }
            summary.max_dbtime = summary.max_dbtime.max(entry.mod_time);
            let permit = sem
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| OscarError::fatal(format!("runner semaphore closed: {e}")))?;
            let log = self.log.clone();
            let dead_letter = self.config.dead_letter_terminal_failures;
            let policy = self.config.policy.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                dispatch_entry(&log, entry, dead_letter, policy).await
            }));
        }
        for handle in handles {
            match handle.await {
                Ok(Ok(outcome)) => summary.record(outcome),
                Ok(Err(e)) => return Err(e),
                Err(join_err) => return Err(OscarError::fatal(format!("runner task panicked: {join_err}"))),
            }
        }
        Ok(summary)
    }

    /// Done entries with a non-empty `Error`: the dead-letter view for
    /// operator triage, expressed as a plain scan (SPEC_FULL §2a) rather
    /// than a separate storage kind.
    pub async fn dead_letters(&self, after: DbTime) -> Result<Vec<ActionEntry>> {
        Ok(self
            .log
            .scan_after(after, None)
            .await?
            .into_iter()
            .filter(|e| e.is_done() && !e.error.is_empty())
            .collect())
    }
}

async fn dispatch_entry<K: Kv>(
    log: &Arc<ActionLog<K>>,
    scanned: ActionEntry,
    dead_letter: bool,
    policy: Option<Arc<dyn PolicyChecker>>,
) -> Result<Outcome> {
    if scanned.is_done() {
        return Ok(Outcome::SkippedDone);
    }
    if !scanned.approved() {
        return Ok(Outcome::SkippedNotApproved);
    }

    let namespace = scanned.namespace.clone();
    let user_key = scanned.key.clone();
    let unique = scanned.unique;

    let _entry_guard = log.kv.lock(&entry_lock_name(&namespace, &user_key, unique)).await?;
    let fresh = log
        .get(&namespace, &user_key, unique)
        .await?
        .ok_or_else(|| OscarError::fatal("entry vanished between scan and dispatch"))?;
    if fresh.is_done() {
        return Ok(Outcome::SkippedDone);
    }
    if !fresh.approved() {
        return Ok(Outcome::SkippedNotApproved);
    }

    let actioner = log
        .actioner_for(&namespace)
        .ok_or_else(|| OscarError::fatal(format!("no actioner registered for namespace {namespace}")))?;
    let _namespace_guard = log.kv.lock(&namespace_lock_name(&namespace)).await?;

    tracing::debug!(target: "oscar.action", namespace = %namespace, unique, "dispatching action");
    let run_result = run_actioner_catching_panics(actioner, fresh.action.clone()).await;
    match run_result {
        Ok(result) => {
            let verdicts = match &policy {
                Some(checker) => checker.check(&[], &String::from_utf8_lossy(&result)).await,
                None => Vec::new(),
            };
            if let Some(violation) = verdicts.iter().find(|v| !v.allowed) {
                let msg = format!("policy {} violated: {}", violation.policy, violation.reason);
                tracing::warn!(target: "oscar.action", namespace = %namespace, unique, %msg, "policy violation");
                log.complete_entry(&namespace, &user_key, unique, Vec::new(), msg, verdicts).await?;
                return Ok(Outcome::TerminalFailure);
            }
            log.complete_entry(&namespace, &user_key, unique, result, String::new(), verdicts).await?;
            Ok(Outcome::Succeeded)
        }
        Err(ActionError::Transient(msg)) => {
            tracing::warn!(target: "oscar.action", namespace = %namespace, unique, %msg, "transient action failure");
            log.record_transient_error(&namespace, &user_key, unique, msg).await?;
            Ok(Outcome::TransientFailure)
        }
        Err(ActionError::Terminal(msg)) => {
            if dead_letter {
                tracing::warn!(target: "oscar.action", namespace = %namespace, unique, %msg, "terminal action failure (dead letter)");
            }
            log.complete_entry(&namespace, &user_key, unique, Vec::new(), msg, Vec::new()).await?;
            Ok(Outcome::TerminalFailure)
        }
    }
}

async fn run_actioner_catching_panics(
    actioner: Arc<dyn Actioner>,
    action: Vec<u8>,
) -> std::result::Result<Vec<u8>, ActionError> {
    match tokio::spawn(async move { actioner.run(&action).await }).await {
        Ok(inner) => inner,
        Err(join_err) => Err(ActionError::Terminal(format!("actioner panicked: {join_err}"))),
    }
}
