use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tandem_store::snapshot::SnapshotSchedule;
use tandem_store::{
    AppConfig, Bootstrap, DirectoryBackend, LocalStoreConfig, LockManager, ShutdownHooks,
    SnapshotOutcome, SnapshotWriter,
    web::{HealthState, build_router},
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "tandem_store=info,tower_http=info";

#[derive(Parser)]
#[command(name = "tandem-store")]
#[command(about = "Local database lifecycle manager for the Tandem expense tracker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Open the local database, snapshot it periodically, and serve /health
    Serve,
    /// Open the local database, write one snapshot, and exit
    Snapshot,
    /// Show who holds the data directory lock
    LockInfo,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = AppConfig::from_env().context("failed to load configuration")?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Snapshot => snapshot_once(require_local(&config)?).await,
        Command::LockInfo => lock_info(require_local(&config)?).await,
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn require_local(config: &AppConfig) -> Result<&LocalStoreConfig> {
    match &config.local {
        Some(local) => Ok(local),
        None => bail!("PGLITE_DATA_DIR is not set; local mode is not configured"),
    }
}

async fn serve(config: AppConfig) -> Result<()> {
    let addr = config.address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;

    let Some(local) = config.local.as_ref() else {
        info!(address = %addr, "serving in cloud mode");
        axum::serve(listener, build_router(HealthState::cloud()))
            .with_graceful_shutdown(termination())
            .await
            .context("server error")?;
        return Ok(());
    };

    let opened = Bootstrap::new(DirectoryBackend)
        .open(local)
        .await
        .context("failed to open local database")?;

    let writer = Arc::new(SnapshotWriter::new(
        opened.storage.clone(),
        opened.snapshot_path.clone(),
        local.snapshot_policy.clone(),
    ));
    let schedule = writer.schedule(local.snapshot_interval);

    info!(
        address = %addr,
        data_dir = %local.data_dir.display(),
        lock_owner = opened.lock.record().owner_pid,
        was_restored = opened.was_restored,
        "serving in local mode"
    );

    let served = axum::serve(listener, build_router(HealthState::local(writer.reporter())))
        .with_graceful_shutdown(termination())
        .await;

    release_local_store(schedule, &opened.hooks).await;
    served.context("server error")
}

/// Lets the running snapshot finish, then runs the hooks that release the
/// data directory lock.
async fn release_local_store(schedule: SnapshotSchedule, hooks: &ShutdownHooks) {
    schedule.stop().await;
    let ran = hooks.run();
    info!(hooks = ran, "local store released");
}

async fn snapshot_once(local: &LocalStoreConfig) -> Result<()> {
    let opened = Bootstrap::new(DirectoryBackend)
        .open(local)
        .await
        .context("failed to open local database")?;

    let writer = SnapshotWriter::new(
        opened.storage.clone(),
        opened.snapshot_path.clone(),
        local.snapshot_policy.clone(),
    );
    let outcome = writer.attempt_snapshot().await;
    opened.hooks.run();

    match outcome {
        SnapshotOutcome::Written { attempts } => {
            println!(
                "snapshot written to {} after {} attempt(s)",
                opened.snapshot_path.display(),
                attempts
            );
            Ok(())
        }
        SnapshotOutcome::Failed { attempts } => {
            let status = writer.reporter().get_status();
            bail!(
                "snapshot failed after {} attempt(s): {}",
                attempts,
                status.last_error.unwrap_or_default()
            )
        }
        SnapshotOutcome::Skipped => bail!("snapshot already in progress"),
    }
}

async fn lock_info(local: &LocalStoreConfig) -> Result<()> {
    let locks = LockManager::default();
    match locks
        .inspect(&local.data_dir)
        .await
        .context("failed to read lock file")?
    {
        Some((record, staleness)) => {
            println!("holder pid:  {}", record.owner_pid);
            println!("acquired at: {}", record.acquired_at.to_rfc3339());
            println!("started at:  {}", record.started_at.to_rfc3339());
            match record.start_time_ticks {
                Some(ticks) => println!("start ticks: {}", ticks),
                None => println!("start ticks: unavailable"),
            }
            println!("stale:       {} ({:?})", staleness.is_stale(), staleness);
        }
        None => println!("data directory is not locked"),
    }
    Ok(())
}

/// Resolves on the first SIGINT or SIGTERM.
async fn termination() {
    let signal = wait_for_signal().await;
    info!(signal, "stopping server");
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => Some(sigterm),
        Err(err) => {
            warn!(error = %err, "SIGTERM handler unavailable");
            None
        }
    };
    let terminated = async {
        match sigterm.as_mut() {
            Some(sigterm) => {
                sigterm.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    let interrupted = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "SIGINT handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = interrupted => "SIGINT",
        _ = terminated => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "Ctrl+C handler unavailable");
        std::future::pending::<()>().await;
    }
    "Ctrl+C"
}
