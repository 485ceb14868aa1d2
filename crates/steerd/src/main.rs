//! steerd — the Steer daemon.
//!
//! Single binary that assembles the Steer subsystems:
//! - State store (redb)
//! - Selection engine (telemetry poll, scoring, cost control, redistribution)
//! - REST API
//!
//! # Usage
//!
//! ```text
//! steerd run --config /etc/steer/steer.toml --data-dir /var/lib/steer --port 8080
//! steerd check --config /etc/steer/steer.toml
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::{oneshot, watch};
use tracing::{error, info};

use steer_balancer::{Engine, SessionPolicy, Settings, http_source, seed_backends};
use steer_core::SteerConfig;
use steer_state::StateStore;

#[derive(Parser)]
#[command(name = "steerd", about = "Steer adaptive CDN selection daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine and the API server.
    Run {
        /// Path to steer.toml.
        #[arg(long, default_value = "steer.toml")]
        config: PathBuf,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/steer")]
        data_dir: PathBuf,

        /// Port to listen on.
        #[arg(long, default_value = "8080")]
        port: u16,
    },
    /// Validate a config file and print it with defaults filled in.
    Check {
        /// Path to steer.toml.
        #[arg(long, default_value = "steer.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run {
            config,
            data_dir,
            port,
        } => run(&config, &data_dir, port).await,
        Command::Check { config } => check(&config),
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,steerd=debug,steer=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn check(config_path: &Path) -> anyhow::Result<()> {
    let config = SteerConfig::from_file(config_path)?;
    print!("{}", config.to_toml_string()?);
    info!(path = ?config_path, backends = config.backends.len(), "config is valid");
    Ok(())
}

async fn run(config_path: &Path, data_dir: &Path, port: u16) -> anyhow::Result<()> {
    info!("Steer daemon starting");

    let config = SteerConfig::from_file(config_path)?;
    info!(path = ?config_path, backends = config.backends.len(), "config loaded");

    // Ensure data directory exists.
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("steer.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    seed_backends(&store, &config)?;

    let engine = Arc::new(Engine::new(
        store,
        http_source(config.engine.probe_timeout()?),
        Settings::from_config(&config)?,
        SessionPolicy::from_config(&config)?,
    )?);

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start engine loop ──────────────────────────────────────

    let tick_interval = config.engine.tick_interval()?;
    let engine_loop = tokio::spawn(Arc::clone(&engine).run(tick_interval, shutdown_rx));
    let (engine_done_tx, engine_done_rx) = oneshot::channel::<()>();
    let engine_handle = tokio::spawn(async move {
        let result = engine_loop.await;
        let _ = engine_done_tx.send(());
        result
    });

    // ── Start API server ───────────────────────────────────────

    let router = steer_api::build_router(engine);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C, or when the engine loop ends on its own.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!(error = %e, "cannot listen for Ctrl-C; shutting down");
                }
                info!("shutdown signal received");
            }
            _ = engine_done_rx => {
                error!("engine loop stopped unexpectedly; shutting down API");
            }
        }
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // The engine flushes buffered events on its way out.
    match engine_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) | Err(e) => {
            error!(error = %e, "engine task failed");
            return Err(e.into());
        }
    }

    info!("Steer daemon stopped");
    Ok(())
}
