//! fleetd: the FleetGrid daemon.
//!
//! Single binary that assembles the FleetGrid subsystems:
//! - State store (redb), seeded from the inventory in `fleetd.toml`
//! - Rollout pool worker, restored from the rollout journal
//! - Fleet coordinator for async agents
//! - REST API
//!
//! # Usage
//!
//! ```text
//! fleetd serve --config /etc/fleetgrid/fleetd.toml --port 8443
//! ```

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn};

use fleetgrid_rollout::{AsyncAgent, FleetCoordinator, RolloutPool};
use fleetgrid_state::StateStore;

use crate::config::FleetdConfig;

#[derive(Parser)]
#[command(name = "fleetd", about = "FleetGrid rollout daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane: state store, rollout pool, coordinator and API.
    Serve {
        /// Path to fleetd.toml.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on. Overrides `[server] port`.
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state. Overrides `[storage] data_dir`.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Serve {
            config,
            port,
            data_dir,
        } => {
            let mut config = match config {
                Some(path) => {
                    let loaded = FleetdConfig::from_file(&path)?;
                    info!(path = ?path, "configuration loaded");
                    loaded
                }
                None => FleetdConfig::default(),
            };
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(data_dir) = data_dir {
                config.storage.data_dir = data_dir;
            }
            run_serve(config).await
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,fleetd=debug,fleetgrid=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run_serve(config: FleetdConfig) -> anyhow::Result<()> {
    info!("FleetGrid daemon starting");

    // Ensure data directory exists.
    std::fs::create_dir_all(&config.storage.data_dir)?;
    let db_path = config.storage.data_dir.join("fleetd.redb");

    // ── Initialize subsystems ──────────────────────────────────

    // State store.
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    config.seed(&store)?;

    // Rollout pool, rebuilt from the journal before it takes new work.
    let (pool, mut worker) = RolloutPool::with_journal(Arc::new(store.clone()));
    let restored = worker.restore().await?;
    let worker = worker.with_retention(config.pool.retention());
    info!(restored, retention_secs = config.pool.retention_secs, "rollout pool initialized");

    // Fleet coordinator.
    let coordinator = FleetCoordinator::new(
        pool.clone(),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        config.coordinator.to_config(),
    );
    info!("fleet coordinator initialized");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let pool_handle = tokio::spawn(worker.run(shutdown_rx));
    resume_coordination(&store, &pool, &coordinator).await?;

    // ── Start API server ───────────────────────────────────────

    let state = fleetgrid_api::ApiState::new(store, pool, coordinator.clone());
    let router = fleetgrid_api::build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for shutdown signal");
        }
        info!("shutdown signal received");
    });

    server.await?;

    // Coordinator tasks query the pool, so they stop before its worker.
    coordinator.stop_all().await;
    let _ = shutdown_tx.send(true);
    let _ = pool_handle.await;

    info!("FleetGrid daemon stopped");
    Ok(())
}

/// Restart coordination for restored rollouts that are not over yet,
/// including those caught walking back.
async fn resume_coordination(
    store: &StateStore,
    pool: &RolloutPool,
    coordinator: &FleetCoordinator,
) -> anyhow::Result<()> {
    for snapshot in pool.list().await {
        if snapshot.phase.is_terminal() {
            continue;
        }
        let mut agents: Vec<AsyncAgent> = Vec::new();
        for id in snapshot.agents.keys() {
            if let Some(agent) = store.get_agent(*id)?.and_then(|a| a.as_async()) {
                agents.push(agent);
            }
        }
        if !agents.is_empty() {
            coordinator.start(snapshot.key, agents).await;
        }
    }
    Ok(())
}
