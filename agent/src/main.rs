//! Entry point (§6): parses the CLI, loads and normalizes the YAML
//! config, wires up the runtime, and runs until a shutdown signal.

mod config;
mod persistent_cache;
mod registry;
mod sources;
mod ssh;
mod wiring;
mod yaml;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use agent_core::Stats;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::ssh::SshPool;

#[derive(Debug, Parser)]
#[command(name = "monitoring-agent", about = "Periodic-source monitoring agent")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, value_name = "PATH")]
    config: PathBuf,

    /// Force debug-level logging regardless of the config's `debug` key.
    #[arg(long)]
    debug: bool,

    /// Validate the configuration and exit without starting any runtime.
    #[arg(long)]
    check_config: bool,

    /// Directory for cursor files, the SSH known_hosts store, and other
    /// on-disk state.
    #[arg(long, value_name = "PATH", default_value = "/var/lib/monitoring-agent")]
    state_dir: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(agent_core::AgentError::from(err).exit_code() as u8);
        }
    };

    init_tracing(cli.debug || config.debug);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("failed to start async runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    if cli.check_config {
        return match runtime.block_on(check_config(&config, &cli.state_dir)) {
            Ok(()) => {
                tracing::info!(path = %cli.config.display(), "configuration is valid");
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("configuration error: {err}");
                ExitCode::from(agent_core::AgentError::from(err).exit_code() as u8)
            }
        };
    }

    match runtime.block_on(run(config, cli.state_dir)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "fatal error");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

/// Builds the full runtime graph (sources, thresholds, outputs) but
/// never calls `start`: every validation a `Supervisor` would hit at
/// startup runs here instead, without spawning timers or dialing out.
async fn check_config(config: &config::Config, state_dir: &PathBuf) -> Result<(), agent_core::ConfigError> {
    let stats = Arc::new(Stats::new());
    let ssh_pool = Arc::new(SshPool::new());
    let registry = registry::build(stats.clone(), ssh_pool, state_dir.clone());
    wiring::build_supervisor(config, &registry, stats).await.map(|_| ())
}

async fn run(config: config::Config, state_dir: PathBuf) -> Result<(), agent_core::AgentError> {
    if let Err(err) = std::fs::create_dir_all(&state_dir) {
        tracing::warn!(path = %state_dir.display(), error = %err, "could not create state directory");
    }

    let stats = Arc::new(Stats::new());
    let ssh_pool = Arc::new(SshPool::new());
    let registry = registry::build(stats.clone(), ssh_pool.clone(), state_dir.clone());

    let supervisor = wiring::build_supervisor(&config, &registry, stats)
        .await
        .map_err(agent_core::AgentError::Config)?;

    supervisor
        .start()
        .await
        .map_err(agent_core::AgentError::Other)?;

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, stopping");

    supervisor.stop().await;
    ssh_pool.shutdown().await;

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    let mut int = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {}
        _ = int.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_tracing(debug: bool) {
    let default_directive = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}
