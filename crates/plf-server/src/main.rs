use anyhow::{Context, Result};
use clap::Parser;
use plf_core::config::expand_tilde;
use plf_server::{
    router, shutdown_signal, AppState, ApplyHook, JsonEntityStore, Settings, SyncDb,
};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "plf-server", about = "plf-sync collector API")]
struct Args {
    /// Path to server configuration TOML file
    #[arg(long, default_value = "~/.config/plf/server.toml")]
    config: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config_path = expand_tilde(&args.config);
    let settings = Settings::from_file(&config_path)?;

    let db = SyncDb::open(&settings.database.path)
        .await
        .with_context(|| {
            format!(
                "failed to open server database {}",
                settings.database.path.display()
            )
        })?;
    let hook = JsonEntityStore::new();
    hook.prepare(db.pool())
        .await
        .context("failed to prepare entity store")?;

    let state = AppState::new(db, Arc::new(hook), &settings);
    let app = router(state);

    let host: IpAddr = settings
        .server
        .host
        .parse()
        .with_context(|| format!("invalid server.host {:?}", settings.server.host))?;
    let addr = SocketAddr::new(host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(
        %addr,
        database = %settings.database.path.display(),
        "plf-server listening"
    );

    let signal = shutdown_signal().context("failed to install signal handlers")?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let received = signal.await;
            tracing::info!(signal = received, "shutting down");
        })
        .await
        .context("server error")?;
    tracing::info!("plf-server stopped");
    Ok(())
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
