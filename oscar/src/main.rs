use std::sync::Arc;
use std::time::Duration;

use oscar_kv::{Kv, MemKv, RedbKv};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use oscar::{Core, CoreConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown requested");
        shutdown.cancel();
    });

    match parse_db_path() {
        Some(path) => {
            tracing::info!(path = %path, "using RedbKv");
            let kv = Arc::new(RedbKv::open(&path)?);
            run_core(kv, CoreConfig::default(), cancel).await
        }
        None => {
            tracing::info!("no OSCAR_DB_PATH / --db-path set, using MemKv");
            let kv = Arc::new(MemKv::new());
            run_core(kv, CoreConfig::default(), cancel).await
        }
    }
}

/// `--db-path <path>` CLI arg or `OSCAR_DB_PATH` env var, CLI taking
/// precedence.
fn parse_db_path() -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    if let Some(path) = args.windows(2).find(|w| w[0] == "--db-path").map(|w| w[1].clone()) {
        return Some(path);
    }
    std::env::var("OSCAR_DB_PATH").ok()
}

/// Periodically sweeps for stale bisection tasks and dispatches any
/// approved, undone action log entries the embedding process has
/// registered actioners for. No actioners ship with this binary (spec §1
/// Non-goals) — this loop demonstrates the wiring an embedding process
/// builds on, and keeps task housekeeping running even with none
/// registered.
async fn run_core<K: Kv + 'static>(
    kv: Arc<K>,
    config: CoreConfig,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let core = Core::new(kv, config);
    let runner = oscar_action::Runner::new(core.action_log.clone(), core.config.runner.clone());

    let mut last_dbtime = 0i64;
    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("core loop exiting");
                return Ok(());
            }
            _ = ticker.tick() => {
                let summary = runner.run(last_dbtime, &cancel).await?;
                if summary.dispatched > 0 {
                    tracing::info!(?summary, "runner pass complete");
                }
                if summary.max_dbtime > last_dbtime {
                    last_dbtime = summary.max_dbtime;
                }

                let deadline = wall_now() - core.config.stale_task_deadline_nanos;
                for task_id in core.tasks.find_stale(deadline).await? {
                    tracing::warn!(task_id = %task_id, "restarting stale bisection task");
                    core.tasks.restart(&task_id).await?;
                }
            }
        }
    }
}

fn wall_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

