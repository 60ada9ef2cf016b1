//! syncdeck binary
//!
//! `run` mirrors server state until interrupted, `worker` serves the worker
//! protocol on stdio, `publish` drives one publish through a supervised worker.

mod cli;

use std::time::Duration;

use clap::Parser;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use crate::cli::{Cli, Commands, ConfigSubcommand};
use syncdeck::config::{self, LoggingSettings, SyncConfig};
use syncdeck::connection::ConnectionState;
use syncdeck::logging::{self, Console};
use syncdeck::supervisor::{MockPublisher, WorkerRuntime, WorkerSupervisor, WorkerTransport};
use syncdeck::sync::{LogEvent, MirrorEvent, SyncSession};
use syncdeck::version::{self, BuildInfo};
use syncdeck::{Error, Result};

/// How long runtime teardown waits on blocking stdio reads
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Commands that don't need the configuration file
    match &cli.command {
        Commands::Version => {
            version::print_version();
            return Ok(());
        }
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            return handle_config_command(subcommand.clone());
        }
        Commands::Worker => return run_worker_process(cli.verbose, cli.quiet),
        _ => {}
    }

    let (config_path, url_override) = match &cli.command {
        Commands::Run { config, url } => (config.clone(), url.clone()),
        Commands::Publish { config, .. } => (config.clone(), None),
        _ => (None, None),
    };

    let config = match load_config(config_path.as_deref(), url_override) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprint!("{}", e.format_for_terminal());
            std::process::exit(e.exit_code());
        }
    };

    // The guards must be kept alive for the lifetime of the program
    let log_guards = logging::init_logging(&config.logging, cli.verbose, cli.quiet, Console::Stdout)?;

    let build = BuildInfo::current();
    info!(
        version = %build.full_version(),
        target = %build.target,
        profile = %build.profile,
        "Starting syncdeck"
    );

    let runtime = build_runtime()?;
    let result = match cli.command {
        Commands::Run { .. } => runtime.block_on(run_sync(config)),
        Commands::Publish { payload, in_process, .. } => {
            runtime.block_on(run_publish(config, &payload, in_process))
        }
        Commands::Version | Commands::Config { .. } | Commands::Worker => {
            // Already handled above
            unreachable!();
        }
    };

    if let Err(ref e) = result {
        error!(error = %e.format_for_log(), retryable = e.is_retryable(), "syncdeck stopped");
        drop(log_guards);
        eprint!("{}", e.format_for_terminal());
        std::process::exit(e.exit_code());
    }
    drop(log_guards);
    Ok(())
}

/// Load configuration, then apply CLI overrides on top
fn load_config(path: Option<&str>, url: Option<String>) -> Result<SyncConfig> {
    let mut config = SyncConfig::load(path)?;
    if let Some(url) = url {
        config.client.url = url;
        config.validate()?;
    }
    Ok(config)
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(num_cpus::get().clamp(1, 4))
        .thread_name("syncdeck")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))
}

// ─────────────────────────────────────────────────────────────────
// run
// ─────────────────────────────────────────────────────────────────

/// Mirror server state until interrupted or reconnection gives up
async fn run_sync(config: SyncConfig) -> Result<()> {
    let url = config.client.url.clone();
    let session = SyncSession::new(config.connection_config(), config.session_config());

    let mut status = session.watch_status();
    let mut mirror = session.subscribe_mirror();
    let mut logs = session.subscribe_logs();

    session.start(&url)?;
    info!(url = %url, "Sync session started");

    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    let outcome = loop {
        tokio::select! {
            _ = &mut interrupt => {
                info!("Interrupt received, shutting down");
                break Ok(());
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let current = *status.borrow_and_update();
                info!(
                    status = %current.kind,
                    attempts = current.attempts,
                    delay_ms = ?current.delay_ms,
                    "Connection status"
                );
                if session.connection().state() == ConnectionState::Closed {
                    break Err(Error::connection_failed(
                        url.as_str(),
                        format!("gave up after {} attempts", current.attempts),
                    ));
                }
            }
            event = mirror.recv() => match event {
                Ok(MirrorEvent::Replaced { version, .. }) => info!(version, "Snapshot applied"),
                Ok(MirrorEvent::Patched { to_version, ops, .. }) => {
                    debug!(version = to_version, ops = ops.len(), "Patch applied")
                }
                Ok(MirrorEvent::PatchDiscarded { current_version, reason, .. }) => {
                    warn!(version = current_version, %reason, "Patch discarded")
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Mirror observer lagged"),
                Err(RecvError::Closed) => break Ok(()),
            },
            event = logs.recv() => match event {
                Ok(LogEvent::History(entries)) => info!(entries = entries.len(), "Server log history received"),
                Ok(LogEvent::Append(entries)) => {
                    for entry in entries {
                        info!(target: "syncdeck::server", "{}", entry);
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Log observer lagged"),
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    };

    session.shutdown().await;
    info!(version = session.version(), "Sync session stopped");
    outcome
}

// ─────────────────────────────────────────────────────────────────
// publish
// ─────────────────────────────────────────────────────────────────

/// Init, healthcheck and publish once, then shut the worker down
async fn run_publish(config: SyncConfig, payload: &str, in_process: bool) -> Result<()> {
    let payload: Value = serde_json::from_str(payload)
        .map_err(|e| Error::config_field_invalid("payload", format!("not valid JSON: {}", e)))?;

    let transport = if in_process || config.worker.in_process {
        WorkerTransport::in_process(MockPublisher::new())
    } else {
        let command = config.worker_command()?;
        info!(command = %command, "Spawning worker");
        WorkerTransport::spawn(&command)?
    };

    let supervisor = WorkerSupervisor::start(transport, config.supervisor_config());
    let outcome = publish_once(&supervisor, config.runner_config(), payload).await;

    match supervisor.shutdown(Some("publish complete".to_string())).await {
        Ok(ack) => debug!(?ack, "Worker shut down"),
        Err(e) => warn!(error = %e, "Worker shutdown was not acknowledged"),
    }

    let receipt = outcome?;
    println!("{}", serde_json::to_string_pretty(&receipt)?);
    Ok(())
}

async fn publish_once(supervisor: &WorkerSupervisor, runner_config: Value, payload: Value) -> Result<Value> {
    let identity = supervisor.init(runner_config).await?;
    info!(worker_id = %identity.worker_id, version = %identity.version, "Worker ready");

    let health = supervisor.healthcheck().await?;
    info!(status = ?health.status, "Worker healthcheck");

    supervisor.submit_task(payload).await
}

// ─────────────────────────────────────────────────────────────────
// worker
// ─────────────────────────────────────────────────────────────────

/// Serve the worker protocol on stdio; stdout is reserved for frames
fn run_worker_process(verbose: u8, quiet: bool) -> Result<()> {
    let mut settings = LoggingSettings::default();
    if let Ok(level) = std::env::var("SYNCDECK_LOG_LEVEL") {
        settings.level = level;
    }
    let log_guards = logging::init_logging(&settings, verbose, quiet, Console::Stderr)?;

    let worker_id = format!("worker-{}-{}", version::host_name(), std::process::id());
    let runtime = build_runtime()?;
    runtime.block_on(
        WorkerRuntime::new(MockPublisher::new())
            .with_worker_id(worker_id)
            .serve_stdio(),
    );

    // A pending stdin read would otherwise hold the runtime open
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
    Ok(())
}

// ─────────────────────────────────────────────────────────────────
// config
// ─────────────────────────────────────────────────────────────────

fn handle_config_command(subcommand: ConfigSubcommand) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = SyncConfig::load(config.as_deref())?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            let written = config::init_config(path.as_deref(), force)?;
            println!("Configuration written to {}", written.display());
        }
        ConfigSubcommand::Validate { config } => match SyncConfig::load(config.as_deref()) {
            Ok(_) => println!("Configuration is valid."),
            Err(e) => {
                eprint!("{}", e.format_for_terminal());
                std::process::exit(e.exit_code());
            }
        },
    }

    Ok(())
}
