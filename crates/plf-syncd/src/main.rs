use anyhow::{Context, Result};
use clap::Parser;
use plf_core::config::{self, Settings};
use plf_core::LocalDb;
use plf_syncd::{shutdown_signal, DaemonOptions, HttpTransport, SnapshotSchedule, SyncDaemon};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "plf-syncd", about = "Background sync daemon for plf-sync")]
struct Args {
    /// Path to the configuration file (defaults to ~/.config/plf/plf.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the database path from the configuration file
    #[arg(long)]
    database: Option<PathBuf>,

    /// Run a single sync cycle and exit
    #[arg(long)]
    once: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config_path = match &args.config {
        Some(path) => config::expand_tilde(path),
        None => config::default_config_path()?,
    };
    let settings = Settings::load_from(&config_path)?;
    let db_path = args
        .database
        .as_deref()
        .map(config::expand_tilde)
        .unwrap_or_else(|| settings.database.path.clone());

    let db = LocalDb::open(&db_path)
        .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
    let sync_config = db.sync_config()?;
    tracing::info!(
        config = %config_path.display(),
        database = %db_path.display(),
        device_id = %sync_config.device_id,
        enabled = sync_config.enabled,
        "plf-syncd starting"
    );
    if sync_config.server_url.is_empty() {
        tracing::info!("no server configured; set one with `plf config --server-url`");
    }

    let transport = HttpTransport::new(settings.sync.request_timeout())
        .context("Failed to build HTTP client")?;
    let options = daemon_options(&settings)?;
    let mut daemon = SyncDaemon::new(db, Arc::new(transport), options);

    if args.once {
        daemon.tick().await;
        return Ok(());
    }

    let signal = shutdown_signal().context("Failed to install signal handlers")?;
    let handle = daemon.start();
    let received = signal.await;
    tracing::info!(signal = received, "stopping plf-syncd");
    handle.stop().await;
    Ok(())
}

fn daemon_options(settings: &Settings) -> Result<DaemonOptions> {
    let snapshot = match (
        settings.snapshot.resolved_password()?,
        settings.snapshot.interval(),
    ) {
        (Some(password), Some(every)) => Some(SnapshotSchedule {
            password,
            every,
            dir: Some(settings.snapshot.dir.clone()),
            keep: settings.snapshot.keep,
        }),
        (None, Some(_)) => {
            tracing::warn!("snapshot interval set without a password; snapshots disabled");
            None
        }
        _ => None,
    };
    Ok(DaemonOptions {
        batch_size: settings.sync.batch_size,
        error_backoff: settings.sync.error_backoff(),
        retention: Some(settings.sync.retention()),
        snapshot,
    })
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}
