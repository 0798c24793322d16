//! capgridd — the capgrid daemon.
//!
//! Single binary that assembles the capgrid subsystems:
//! - State store (redb)
//! - Scheduler, restored from the store and seeded from config
//! - REST API
//!
//! # Usage
//!
//! ```text
//! capgridd serve --port 8470 --data-dir /var/lib/capgrid --config capgrid.toml
//! ```

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use capgrid_scheduler::Scheduler;
use capgrid_state::StateStore;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{DaemonConfig, Overrides};

#[derive(Parser)]
#[command(name = "capgridd", about = "capgrid cluster scheduler daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the scheduler over HTTP.
    Serve {
        /// Port to listen on.
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Path to capgrid.toml.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of runtime worker threads.
        #[arg(long)]
        workers: Option<usize>,

        /// Default cluster lock wait in milliseconds (0 waits indefinitely).
        #[arg(long)]
        lock_timeout_ms: Option<u64>,

        /// Emit logs as JSON lines.
        #[arg(long)]
        json_logs: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            port,
            data_dir,
            config,
            workers,
            lock_timeout_ms,
            json_logs,
        } => {
            let overrides = Overrides {
                port,
                data_dir,
                workers,
                lock_timeout_ms,
                json_logs,
            };
            let config = DaemonConfig::load(config.as_deref(), overrides)?;
            init_tracing(config.server.json_logs);

            let mut runtime = tokio::runtime::Builder::new_multi_thread();
            if let Some(workers) = config.server.workers {
                runtime.worker_threads(workers);
            }
            runtime
                .enable_all()
                .build()
                .context("failed to build tokio runtime")?
                .block_on(serve(config))
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,capgridd=debug,capgrid=debug"));

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Restore the scheduler and register any configured clusters it lacks.
fn build_scheduler(config: &DaemonConfig, store: StateStore) -> anyhow::Result<Scheduler> {
    let scheduler = Scheduler::restore(store, config.scheduler.clone()).context("failed to restore scheduler state")?;

    let known = scheduler.list_clusters();
    for seed in &config.clusters {
        match known.iter().find(|c| c.id == seed.id) {
            Some(existing) if existing != seed => {
                warn!(
                    cluster_id = seed.id,
                    "configured cluster differs from persisted one; keeping persisted"
                );
            }
            Some(_) => {}
            None => scheduler.register_cluster(seed.clone())?,
        }
    }
    Ok(scheduler)
}

async fn serve(config: DaemonConfig) -> anyhow::Result<()> {
    info!("capgrid daemon starting");

    // Ensure data directory exists.
    std::fs::create_dir_all(&config.server.data_dir)?;
    let db_path = config.db_path();

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let scheduler = Arc::new(build_scheduler(&config, store)?);
    let report = scheduler.reconcile().await?;
    info!(
        clusters = scheduler.list_clusters().len(),
        deployments = scheduler.list_deployments(None).len(),
        transitions = report.transitions.len(),
        "scheduler ready"
    );

    // ── Start API server ───────────────────────────────────────

    let router = capgrid_api::build_router(scheduler);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await?;

    info!("capgrid daemon stopped");
    Ok(())
}
