//! Cross-crate scenarios (E1–E6): exercise the full register → propose →
//! approve → dispatch pipeline, watcher resumption, duplicate task
//! collapse, and overlay composition, the way an embedding process would
//! drive them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use oscar_action::{ActionError, ActionLog, Actioner, Decision, Runner, RunnerConfig};
use oscar_kv::{Kv, MemKv, Overlay};
use oscar_task::{BisectOutcome, BisectionWork, InProcessQueue, ProgressSink, TaskClient, TaskSpec};
use oscar_timed::{TimedIndex, Watcher};
use tokio_util::sync::CancellationToken;

struct SpellFixer {
    calls: std::sync::atomic::AtomicUsize,
}

#[async_trait]
impl Actioner for SpellFixer {
    async fn run(&self, action: &[u8]) -> Result<Vec<u8>, ActionError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(action.to_vec())
    }
}

struct AlwaysFails;

#[async_trait]
impl Actioner for AlwaysFails {
    async fn run(&self, _action: &[u8]) -> Result<Vec<u8>, ActionError> {
        Err(ActionError::Terminal("action failed".into()))
    }
}

fn user_key(repo: &str, path: &str, line: u64) -> Vec<u8> {
    oscar_kv::encode(&[oscar_kv::Elem::str(repo), oscar_kv::Elem::str(path), oscar_kv::Elem::U64(line)])
}

/// E1: an unapproved entry is dispatched exactly once and completes clean.
#[tokio::test]
async fn e1_unapproved_entry_runs_exactly_once() {
    let kv = Arc::new(MemKv::new());
    let log = ActionLog::new(kv);
    let actioner = Arc::new(SpellFixer {
        calls: std::sync::atomic::AtomicUsize::new(0),
    });
    let handle = log.register("spell", actioner.clone()).unwrap();

    let key = user_key("repo", "x", 18);
    assert!(handle.before(&key, b"{fix}", false).await.unwrap());

    let runner = Runner::new(log.clone(), RunnerConfig::default());
    runner.run(0, &CancellationToken::new()).await.unwrap();

    assert_eq!(actioner.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    let entries = log.scan(Some("spell"), Some("spell")).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].is_done());
    assert_eq!(entries[0].error, "");
}

/// E2: approval-gated entry only runs after a decision arrives; `AddDecision`
/// after completion is rejected.
#[tokio::test]
async fn e2_approval_gates_dispatch() {
    let kv = Arc::new(MemKv::new());
    let log = ActionLog::new(kv);
    let actioner = Arc::new(SpellFixer {
        calls: std::sync::atomic::AtomicUsize::new(0),
    });
    let handle = log.register("spell", actioner.clone()).unwrap();

    let key = user_key("repo", "x", 18);
    handle.before(&key, b"{fix}", true).await.unwrap();

    let runner = Runner::new(log.clone(), RunnerConfig::default());
    runner.run(0, &CancellationToken::new()).await.unwrap();
    assert_eq!(actioner.calls.load(std::sync::atomic::Ordering::SeqCst), 0, "unapproved entry must not run");

    let entries = log.scan(Some("spell"), Some("spell")).await.unwrap();
    let unique = entries[0].unique;
    log.add_decision(
        "spell",
        &key,
        unique,
        Decision {
            name: "a".into(),
            time: 1,
            approved: true,
        },
    )
    .await
    .unwrap();

    runner.run(0, &CancellationToken::new()).await.unwrap();
    assert_eq!(actioner.calls.load(std::sync::atomic::Ordering::SeqCst), 1);

    let err = log
        .add_decision(
            "spell",
            &key,
            unique,
            Decision {
                name: "b".into(),
                time: 2,
                approved: true,
            },
        )
        .await;
    assert!(err.is_err(), "AddDecision after Done must fail");
}

/// E3: a composite run with one failing entry still completes the others;
/// the failed entry's result stays empty and its error is recorded verbatim.
#[tokio::test]
async fn e3_one_failure_does_not_block_the_rest() {
    let kv = Arc::new(MemKv::new());
    let log = ActionLog::new(kv);
    let ok_actioner = Arc::new(SpellFixer {
        calls: std::sync::atomic::AtomicUsize::new(0),
    });
    let bad_actioner = Arc::new(AlwaysFails);
    let ok_handle = log.register("spell", ok_actioner).unwrap();
    let bad_handle = log.register("linkfix", bad_actioner).unwrap();

    ok_handle.before(&user_key("repo", "e1", 1), b"a", false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    ok_handle.before(&user_key("repo", "e2", 2), b"b", false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    bad_handle.before(&user_key("repo", "e3", 3), b"c", false).await.unwrap();

    let runner = Runner::new(log.clone(), RunnerConfig::default());
    let summary = runner.run(0, &CancellationToken::new()).await.unwrap();
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.terminal_failures, 1);

    let all = log.scan_after(0, None).await.unwrap();
    assert_eq!(all.len(), 3);
    let failed = all.iter().find(|e| e.namespace == "linkfix").unwrap();
    assert_eq!(failed.error, "action failed");
    assert!(failed.result.is_empty());
}

/// E4: a watcher resumes past entries it already marked old.
#[tokio::test]
async fn e4_watcher_resumes_after_mark_old() {
    let kv = Arc::new(MemKv::new());
    let timed = Arc::new(TimedIndex::new(kv.clone()));
    let t1 = timed.set("issues", b"K1", b"v1").await.unwrap();
    timed.set("issues", b"K2", b"v2").await.unwrap();

    let watcher = Watcher::new(timed.clone(), "issues", "w");
    {
        let mut session = watcher.recent().await.unwrap();
        assert_eq!(session.entries().len(), 2);
        session.mark_old(t1).await.unwrap();
        session.flush().await.unwrap();
    }

    let watcher2 = Watcher::new(timed.clone(), "issues", "w");
    let session2 = watcher2.recent().await.unwrap();
    let entries2 = session2.entries();
    assert_eq!(entries2.len(), 1);
    assert_eq!(entries2[0].data_key, b"K2");
}

struct Probe;

#[async_trait]
impl BisectionWork for Probe {
    async fn run(&self, _progress: &dyn ProgressSink) -> Result<BisectOutcome, String> {
        Ok(BisectOutcome {
            result: b"abc123".to_vec(),
            output: "found it".into(),
        })
    }
}

/// E5: duplicate bisection submissions collapse onto one task.
#[tokio::test]
async fn e5_duplicate_submission_collapses() {
    let kv = Arc::new(MemKv::new());
    let client = TaskClient::new(kv, InProcessQueue);
    let spec = TaskSpec {
        trigger: "nightly".into(),
        issue: "42".into(),
        repository: "go/oscar".into(),
        good: "abc".into(),
        bad: "def".into(),
        regression: "TestFoo".into(),
    };

    let (id1, created1) = client.submit(spec.clone()).await.unwrap();
    let (id2, created2) = client.submit(spec).await.unwrap();
    assert_eq!(id1, id2);
    assert!(created1);
    assert!(!created2);

    client.bisect(&id1, Arc::new(Probe)).await.unwrap();
    let updates = client.scan_updates_after(0).await.unwrap();
    assert_eq!(updates.len(), 1, "exactly one Updated sequence for the one task");
}

/// E6: overlay reads merge overrides, deletions, and the read-only base.
#[tokio::test]
async fn e6_overlay_composition() {
    let base = Arc::new(MemKv::new());
    base.set(b"a", b"1").await.unwrap();
    base.set(b"b", b"2").await.unwrap();

    let overlay = Overlay::new(base);
    overlay.set(b"b", b"20").await.unwrap();
    overlay.delete(b"a").await.unwrap();
    overlay.set(b"c", b"3").await.unwrap();

    assert_eq!(overlay.get(b"a").await.unwrap(), None);
    let rows = overlay.scan(b"", &[0xff; 16]).await.unwrap();
    assert_eq!(rows, vec![(b"b".to_vec(), b"20".to_vec()), (b"c".to_vec(), b"3".to_vec())]);
}
