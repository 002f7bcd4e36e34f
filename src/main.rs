use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;

use autocoder::api::{self, ApiState};
use autocoder::bridge::Bridge;
use autocoder::config::{BridgeConfig, PoolConfig, SchedulerConfig, WorkerConfig};
use autocoder::git::BranchTracker;
use autocoder::pool::{PoolManager, ProcessProvider};
use autocoder::scheduler::Orchestrator;
use autocoder::worker::{HandlerRegistry, ShellAction, WorkerClient};

const USAGE: &str = "usage: autocoder <bridge|worker>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    match std::env::args().nth(1).as_deref() {
        Some("bridge") | None => run_bridge().await,
        Some("worker") => run_worker().await,
        Some(other) => anyhow::bail!("unknown mode '{other}'\n{USAGE}"),
    }
}

async fn run_bridge() -> anyhow::Result<()> {
    let bridge_config = BridgeConfig::from_env();
    let pool_config = PoolConfig::from_env()?;
    let scheduler_config = SchedulerConfig::from_env();
    let port = bridge_config.port;

    eprintln!("autocoder v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Bridge WS: ws://0.0.0.0:{}/ws", port);
    eprintln!("   Task API:  http://0.0.0.0:{}/api/tasks", port);
    for (name, category) in &pool_config.categories {
        eprintln!(
            "   Pool: {} (ceiling {}, weight {})",
            name, category.ceiling, category.weight
        );
    }

    // ── Bridge + pool ────────────────────────────────────────────────────
    let bridge = Bridge::new(bridge_config);
    bridge.spawn_heartbeat_monitor();

    let mut provider = ProcessProvider::current_exe()?;
    if let Ok(root) = std::env::var("AUTOCODER_SANDBOX_ROOT") {
        provider = provider.with_workdir_root(PathBuf::from(root));
    }
    let pool = PoolManager::new(pool_config, Arc::new(provider));
    pool.spawn_idle_reaper();

    // ── Orchestrator ─────────────────────────────────────────────────────
    let branches = Arc::new(BranchTracker::new());
    let orchestrator = Orchestrator::new(
        scheduler_config,
        Arc::clone(&bridge),
        Arc::clone(&pool),
        branches.clone(),
    );
    orchestrator.spawn();

    let app = api::router(ApiState {
        orchestrator: Arc::clone(&orchestrator),
        branches,
    });

    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("Bridge listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    tracing::info!("Shutting down");
    if let Ok(path) = std::env::var("AUTOCODER_SUMMARY_PATH") {
        let summary = orchestrator.summary().await;
        summary
            .write_to(PathBuf::from(path).as_path())
            .await
            .context("failed to write batch summary")?;
    }
    orchestrator.shutdown().await;
    Ok(())
}

async fn run_worker() -> anyhow::Result<()> {
    let config = WorkerConfig::from_env()?;

    let mut action = ShellAction::new("run-task");
    if let Some(dir) = &config.workdir {
        action = action.with_working_dir(dir.clone());
    }
    let handlers = Arc::new(HandlerRegistry::new());
    handlers.register_sync(Arc::new(action));

    tracing::info!(
        agent_id = %config.agent_id,
        room_id = %config.room_id,
        bridge = %config.bridge_url,
        "Starting worker"
    );
    let client = WorkerClient::new(config, handlers);

    let stopper = Arc::clone(&client);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        stopper.shutdown();
    });

    client.run().await?;
    Ok(())
}
