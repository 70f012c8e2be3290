//! PostgreSQL OAuth token rotator
//!
//! Keeps a PostgreSQL credential artifact (connection string, `.pgpass`, or
//! env file) continuously filled with a valid OAuth access token:
//! 1. Exchanges service principal credentials for a token
//! 2. Writes it atomically into every configured artifact
//! 3. Refreshes it ahead of expiry, retrying failures with back-off
//!
//! `run` is the long-lived mode a service supervisor starts; the other
//! commands are one-shot helpers that talk to a running instance over the
//! local admin API or to the service supervisor.

mod admin;
mod config;
mod error;
mod metrics;
mod service;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pgtoken_artifact::CredentialWriter;
use pgtoken_auth::TokenClient;
use pgtoken_rotation::{
    Clock, EngineStatus, OnceOutcome, RotationEngine, RunOutcome, Scheduler, SystemClock,
};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::{AdminClient, AdminState, StatusReport};
use crate::config::Config;
use crate::error::{EXIT_AUTH, EXIT_OK};
use crate::service::ServiceManager;

#[derive(Parser)]
#[command(name = "pgtoken-rotator")]
#[command(about = "Keeps PostgreSQL credential files backed by a fresh OAuth token")]
#[command(version)]
struct Cli {
    /// Config file (overrides PGTOKEN_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rotate in the foreground until stopped
    Run,
    /// Fetch and write a token once, then exit
    Once {
        /// Attempts before giving up on transient failures
        #[arg(long, default_value_t = 3)]
        attempts: u32,
    },
    /// Show the running rotator's status
    Status {
        /// Print the raw JSON report
        #[arg(long)]
        json: bool,
    },
    /// Ask the running rotator to rotate now
    Rotate,
    /// Ask the running rotator to re-enter its starting phase
    Restart,
    /// Manage the supervisor registration
    #[command(subcommand)]
    Service(ServiceCommand),
}

#[derive(Subcommand)]
enum ServiceCommand {
    /// Register and start the rotator as a user service
    Install,
    /// Stop and unregister the user service
    Uninstall {
        /// Also delete the credential artifacts
        #[arg(long)]
        remove_artifacts: bool,
    },
    /// Show the supervisor's view of the service
    Status,
    /// Restart the service through the supervisor
    Restart,
}

#[tokio::main]
async fn main() {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();
    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = format!("{e:#}"), "command failed");
            eprintln!("error: {e:#}");
            error::exit_code_for(&e)
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let config_path = Config::resolve_path(cli.config.as_deref());

    match cli.command {
        Commands::Run => run(&load_config(&config_path)?).await,
        Commands::Once { attempts } => once(&load_config(&config_path)?, attempts).await,
        Commands::Status { json } => {
            let config = load_config(&config_path)?;
            let report = AdminClient::new(config.admin.listen_addr)?.status().await?;
            print_status(&report, json)?;
            Ok(EXIT_OK)
        }
        Commands::Rotate => {
            let config = load_config(&config_path)?;
            AdminClient::new(config.admin.listen_addr)?.rotate().await?;
            println!("rotation requested");
            Ok(EXIT_OK)
        }
        Commands::Restart => {
            let config = load_config(&config_path)?;
            AdminClient::new(config.admin.listen_addr)?.restart().await?;
            println!("restart requested");
            Ok(EXIT_OK)
        }
        Commands::Service(command) => service_command(command, &config_path).await,
    }
}

fn load_config(path: &Path) -> Result<Config> {
    info!(path = %path.display(), "loading configuration");
    let config = Config::load(path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    info!(
        token_endpoint = %config.oauth.token_endpoint,
        database_host = %config.database.host,
        artifacts = config.artifacts.len(),
        "configuration loaded"
    );
    Ok(config)
}

fn build_engine(
    config: &Config,
    clock: Arc<dyn Clock>,
) -> Result<(RotationEngine, Arc<CredentialWriter>)> {
    let client = TokenClient::new(config.token_client_config())
        .map_err(|e| common::Error::Config(e.to_string()))?;
    let writer = Arc::new(CredentialWriter::new(
        config.database_target(),
        config.artifacts.clone(),
    ));
    let engine = RotationEngine::new(
        Arc::new(client),
        writer.clone(),
        Scheduler::new(config.retry_policy()),
        clock,
    )
    .with_expired_policy(config.rotation.on_expiry);
    Ok((engine, writer))
}

/// Foreground mode: admin API plus rotation loop until a signal arrives.
async fn run(config: &Config) -> Result<i32> {
    // Bind first: an occupied admin address means another instance is running
    let listener = admin::bind(config.admin.listen_addr).await?;
    let prometheus = metrics::install_recorder()?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (engine, _writer) = build_engine(config, clock.clone())?;
    let handle = engine.handle();

    let app = admin::build_admin_router(
        AdminState::new(handle.clone(), clock, prometheus),
        config.admin.max_connections,
    );
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });
    info!(addr = %config.admin.listen_addr, "admin API listening");

    let mut engine_task = tokio::spawn(engine.run());
    let finished = tokio::select! {
        outcome = &mut engine_task => Some(outcome),
        () = shutdown_signal() => None,
    };
    let outcome = match finished {
        Some(outcome) => outcome,
        None => {
            // The engine finishes an in-flight rotation before it exits
            handle.stop();
            engine_task.await
        }
    }
    .context("rotation engine task failed")?;

    let _ = shutdown_tx.send(());
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "admin server error during shutdown"),
        Err(e) => warn!(error = %e, "admin server task panicked"),
    }

    match outcome {
        RunOutcome::Stopped => {
            info!("shutdown complete");
            Ok(EXIT_OK)
        }
        RunOutcome::Failed(e) => Err(error::Error::Auth(e).into()),
    }
}

/// One-shot mode: fetch and write, no admin API.
async fn once(config: &Config, attempts: u32) -> Result<i32> {
    let (engine, _writer) = build_engine(config, Arc::new(SystemClock))?;
    match engine.rotate_once(attempts).await {
        OnceOutcome::Written { expires_at_ms } => {
            println!("credential written, expires {}", format_ms(expires_at_ms));
            Ok(EXIT_OK)
        }
        OnceOutcome::Failed(e) => Err(error::Error::Auth(e).into()),
        OnceOutcome::Exhausted {
            attempts,
            last_error,
        } => Err(error::Error::Exhausted {
            attempts,
            last_error,
        }
        .into()),
    }
}

async fn service_command(command: ServiceCommand, config_path: &Path) -> Result<i32> {
    let manager = ServiceManager::detect()?;
    match command {
        ServiceCommand::Install => {
            // Validate before registering something that would crash-loop
            load_config(config_path)?;
            let config_path = std::path::absolute(config_path).with_context(|| {
                format!("failed to resolve {}", config_path.display())
            })?;
            let exe = std::env::current_exe().context("failed to locate the rotator binary")?;
            let path = manager.install(&exe, &config_path)?;
            println!("installed {}", path.display());
        }
        ServiceCommand::Uninstall { remove_artifacts } => {
            manager.uninstall()?;
            println!("uninstalled {}", manager.definition_path().display());
            if remove_artifacts {
                let config = load_config(config_path)?;
                let (_, writer) = build_engine(&config, Arc::new(SystemClock))?;
                writer.remove().await.context("failed to remove artifacts")?;
                for artifact in writer.artifacts() {
                    println!("removed {}", artifact.path.display());
                }
            }
        }
        ServiceCommand::Status => {
            let status = manager.status()?;
            println!(
                "installed: {}\nrunning:   {}\ndetail:    {}",
                status.installed, status.running, status.detail
            );
            if !status.running {
                return Ok(error::EXIT_UNAVAILABLE);
            }
        }
        ServiceCommand::Restart => {
            manager.restart()?;
            println!("service restarted");
        }
    }
    Ok(EXIT_OK)
}

fn print_status(report: &StatusReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    let snapshot = &report.snapshot;
    let expiry_note = if report.expired { " (expired)" } else { "" };
    println!("status:               {}", snapshot.status.label());
    println!(
        "token expires:        {}{expiry_note}",
        snapshot.expires_at_ms.map_or_else(|| "-".into(), format_ms)
    );
    println!(
        "next refresh in:      {}",
        report
            .time_to_next_refresh_secs
            .map_or_else(|| "-".into(), |s| format!("{s}s"))
    );
    println!(
        "last success:         {}",
        snapshot.last_success_ms.map_or_else(|| "never".into(), format_ms)
    );
    println!("consecutive failures: {}", snapshot.consecutive_failures);
    if let Some(last_error) = &snapshot.last_error {
        println!("last error:           {last_error}");
    }
    if snapshot.status == EngineStatus::Failed {
        println!("exit code:            {EXIT_AUTH}");
    }
    Ok(())
}

/// RFC 3339 rendering of a unix millisecond timestamp.
fn format_ms(ms: u64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| format!("{ms}ms"))
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
