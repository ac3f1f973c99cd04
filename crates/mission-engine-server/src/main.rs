use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use mission_engine::{
    ConfigStore, ExecutionController, KeywordDecomposer, MissionEventBus, MissionStore,
    ResourceMonitor, Scorer, Worker, WorkerId, WorkerPool,
};
use tandem_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent, ProcessKind,
};
use tracing::info;

mod dispatch;
mod http;
mod scheduling;
mod tools;

use http::{serve, AppState};

#[derive(Parser, Debug)]
#[command(name = "mission-engine-server")]
#[command(about = "HTTP/Chat API and WebSocket event stream for the mission engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 3100)]
        port: u16,
        #[arg(long)]
        state_dir: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let logs_dir = canonical_logs_dir_from_root(&state_dir);
            let (_log_guard, _log_info) = init_process_logging(ProcessKind::Engine, &logs_dir, 14)?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent {
                    event: "logging.initialized",
                    component: "mission_engine_server.main",
                    correlation_id: None,
                    session_id: None,
                    run_id: None,
                    message_id: None,
                    provider_id: None,
                    model_id: None,
                    status: Some("ok"),
                    error_code: None,
                    detail: Some("mission-engine-server jsonl logging initialized"),
                },
            );

            let state = build_state(&state_dir).await?;
            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            log_startup_paths(&state_dir, &addr);
            serve(addr, state).await?;
        }
    }

    Ok(())
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("MISSION_ENGINE_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".mission-engine")
}

fn log_startup_paths(state_dir: &PathBuf, addr: &SocketAddr) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let config_path = state_dir.join("config.json");
    info!("starting mission-engine-server on http://{addr}");
    info!(
        "startup paths: exe={} state_dir={} config_path={}",
        exe.display(),
        state_dir.display(),
        config_path.display()
    );
}

async fn build_state(state_dir: &PathBuf) -> anyhow::Result<AppState> {
    let bus = Arc::new(MissionEventBus::new());
    let store = Arc::new(MissionStore::open(state_dir.join("missions"), bus.clone()).await?);
    let config = ConfigStore::new(state_dir.join("config.json")).await?;
    let workers = Arc::new(WorkerPool::new());
    let scorer = Arc::new(Scorer::new());
    let effective = config.get().await;
    let monitor = Arc::new(ResourceMonitor::new(
        effective.per_worker_memory_budget_mib * 1024 * 1024,
    ));
    let initial_worker_count = monitor.safe_worker_count().await;
    for i in 0..initial_worker_count {
        workers.register(Worker::new(WorkerId(format!("local-{i}")))).await;
    }
    let controller = Arc::new(ExecutionController::new(
        store.clone(),
        workers.clone(),
        scorer.clone(),
        Arc::new(tools::UnregisteredToolInvoker),
    ));
    let decomposer = Arc::new(KeywordDecomposer);

    Ok(AppState {
        store,
        workers,
        scorer,
        monitor,
        controller,
        config,
        decomposer,
        schedules: Arc::new(tokio::sync::RwLock::new(std::collections::HashMap::new())),
    })
}
