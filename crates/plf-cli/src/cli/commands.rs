use anyhow::{bail, Context, Result};
use colored::Colorize;
use plf_core::config::{self, Settings};
use plf_core::{snapshot, EntityId, LocalDb, Payload, SyncConfig, SyncConfigUpdate};
use plf_syncd::{DaemonOptions, HttpTransport, SnapshotSchedule, SyncDaemon};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cli::{ConfigArgs, SnapshotCommands};

/// Resolved paths and settings shared by every command.
pub struct CliContext {
    pub settings: Settings,
    pub db_path: PathBuf,
    pub json: bool,
}

impl CliContext {
    pub fn load(config_path: Option<&Path>, database: Option<&Path>, json: bool) -> Result<Self> {
        let config_path = match config_path {
            Some(path) => config::expand_tilde(path),
            None => config::default_config_path()?,
        };
        let settings = Settings::load_from(&config_path)?;
        let db_path = database
            .map(config::expand_tilde)
            .unwrap_or_else(|| settings.database.path.clone());
        Ok(Self {
            settings,
            db_path,
            json,
        })
    }

    pub fn open_db(&self) -> Result<LocalDb> {
        LocalDb::open(&self.db_path)
            .with_context(|| format!("Failed to open database: {}", self.db_path.display()))
    }

    fn transport(&self) -> Result<HttpTransport> {
        HttpTransport::new(self.settings.sync.request_timeout())
            .context("Failed to build HTTP client")
    }
}

/// Numeric strings become integer ids, anything else a text id.
pub fn parse_entity_id(raw: &str) -> EntityId {
    match raw.parse::<i64>() {
        Ok(n) => EntityId::Int(n),
        Err(_) => EntityId::Text(raw.to_string()),
    }
}

pub fn parse_payload(raw: &str) -> Result<Payload> {
    match serde_json::from_str::<Value>(raw).context("payload is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("payload must be a JSON object, got {other}"),
    }
}

fn token_state(config: &SyncConfig) -> &'static str {
    if config.server_token.is_empty() {
        "not set"
    } else {
        "set"
    }
}

fn print_config(config: &SyncConfig, json: bool) {
    if json {
        println!(
            "{}",
            json!({
                "enabled": config.enabled,
                "sync_interval_seconds": config.sync_interval_seconds,
                "server_url": config.server_url,
                "device_id": config.device_id,
                "has_token": !config.server_token.is_empty(),
            })
        );
        return;
    }
    println!("Sync Configuration:");
    println!(
        "  Enabled: {}",
        if config.enabled {
            "Yes".green()
        } else {
            "No".red()
        }
    );
    println!("  Interval: {}s", config.sync_interval_seconds);
    if config.server_url.is_empty() {
        println!("  Server: {}", "not configured".yellow());
    } else {
        println!("  Server: {}", config.server_url.cyan());
    }
    println!("  Token: {}", token_state(config));
    println!("  Device: {}", config.device_id.dimmed());
}

pub fn status(ctx: &CliContext) -> Result<()> {
    let db = ctx.open_db()?;
    let config = db.sync_config()?;
    let stats = db.stats()?;

    if ctx.json {
        println!(
            "{}",
            json!({
                "database": ctx.db_path,
                "enabled": config.enabled,
                "sync_interval_seconds": config.sync_interval_seconds,
                "server_url": config.server_url,
                "device_id": config.device_id,
                "has_token": !config.server_token.is_empty(),
                "pending": stats.pending,
                "synced": stats.synced,
                "last_change_id": stats.last_change_id,
            })
        );
        return Ok(());
    }

    println!("Database: {}", ctx.db_path.display());
    print_config(&config, false);
    println!("Change Log:");
    let pending = if stats.pending == 0 {
        stats.pending.to_string().green()
    } else {
        stats.pending.to_string().yellow()
    };
    println!("  Pending: {pending}");
    println!("  Synced: {}", stats.synced);
    if let Some(last) = stats.last_change_id {
        println!("  Last change id: {last}");
    }
    if !config.is_ready() {
        println!("\nRun 'plf config --enable --server-url <url> --token <token>' to start syncing");
    }
    Ok(())
}

pub fn configure(ctx: &CliContext, args: &ConfigArgs) -> Result<()> {
    let db = ctx.open_db()?;
    let enabled = match (args.enable, args.disable) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    };
    let update = SyncConfigUpdate {
        enabled,
        sync_interval_seconds: args.interval,
        server_url: args.server_url.clone(),
        server_token: args.token.clone(),
    };
    if update.sync_interval_seconds == Some(0) {
        bail!("interval must be at least one second");
    }
    let config = if update.is_empty() {
        db.sync_config()?
    } else {
        let config = db.update_sync_config(&update)?;
        tracing::info!(
            enabled = config.enabled,
            interval = config.sync_interval_seconds,
            server_url = %config.server_url,
            "updated sync configuration"
        );
        config
    };
    print_config(&config, ctx.json);
    Ok(())
}

pub fn record(ctx: &CliContext, entity_type: &str, entity_id: &str, payload: &str) -> Result<()> {
    let payload = parse_payload(payload)?;
    let entity_id = parse_entity_id(entity_id);
    let change_id = ctx.open_db()?.save_entity(entity_type, &entity_id, &payload)?;
    if ctx.json {
        println!("{}", json!({ "change_id": change_id }));
    } else {
        println!(
            "Recorded {} {} as change {}",
            entity_type.cyan(),
            entity_id,
            change_id
        );
    }
    Ok(())
}

pub fn delete(ctx: &CliContext, entity_type: &str, entity_id: &str) -> Result<()> {
    let entity_id = parse_entity_id(entity_id);
    let change_id = ctx.open_db()?.delete_entity(entity_type, &entity_id)?;
    if ctx.json {
        println!("{}", json!({ "change_id": change_id }));
        return Ok(());
    }
    match change_id {
        Some(id) => println!("Deleted {} {} as change {}", entity_type.cyan(), entity_id, id),
        None => println!("{} {} does not exist", entity_type, entity_id),
    }
    Ok(())
}

pub fn show(ctx: &CliContext, entity_type: &str, entity_id: &str) -> Result<()> {
    let entity_id = parse_entity_id(entity_id);
    match ctx.open_db()?.get_entity(entity_type, &entity_id)? {
        Some(payload) => println!("{}", serde_json::to_string_pretty(&payload)?),
        None => bail!("{entity_type} {entity_id} not found"),
    }
    Ok(())
}

pub fn pending(ctx: &CliContext, limit: usize) -> Result<()> {
    let entries = ctx.open_db()?.pending(limit)?;
    if ctx.json {
        let records: Vec<_> = entries.iter().map(|e| e.to_record()).collect();
        println!("{}", serde_json::to_string(&records)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("{}", "Nothing pending".green());
        return Ok(());
    }
    for entry in entries {
        println!(
            "{:>6}  {}  {:<7} {} {}",
            entry.change_id,
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            entry.operation.to_string(),
            entry.entity_type.cyan(),
            entry.entity_id
        );
    }
    Ok(())
}

pub fn prune(ctx: &CliContext, days: Option<u32>) -> Result<()> {
    let days = days.unwrap_or(ctx.settings.sync.retention_days);
    let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(days));
    let removed = ctx.open_db()?.prune_synced(cutoff)?;
    if ctx.json {
        println!("{}", json!({ "removed": removed }));
    } else {
        println!("Removed {removed} synced entries older than {days} days");
    }
    Ok(())
}

// --- Snapshots ---

pub async fn handle_snapshot_command(ctx: &CliContext, cmd: SnapshotCommands) -> Result<()> {
    match cmd {
        SnapshotCommands::Export { output, password } => {
            let password = resolve_password(ctx, password, true)?;
            snapshot_export(ctx, &output, &password)
        }
        SnapshotCommands::Import {
            input,
            force,
            keep_device_id,
            password,
        } => {
            let password = resolve_password(ctx, password, false)?;
            let container = std::fs::read(&input)
                .with_context(|| format!("Failed to read snapshot: {}", input.display()))?;
            snapshot_restore(ctx, &container, &ctx.db_path, &password, force, keep_device_id)
        }
        SnapshotCommands::Push { password } => {
            let password = resolve_password(ctx, password, false)?;
            snapshot_push(ctx, password).await
        }
        SnapshotCommands::Pull {
            device_id,
            output,
            force,
            keep_device_id,
            password,
        } => {
            let password = resolve_password(ctx, password, false)?;
            let target = output.unwrap_or_else(|| ctx.db_path.clone());
            snapshot_pull(ctx, &device_id, &target, &password, force, keep_device_id).await
        }
        SnapshotCommands::List { remote } => {
            if remote {
                snapshot_list_remote(ctx).await
            } else {
                snapshot_list_local(ctx)
            }
        }
    }
}

/// Flag first, then the configuration file, then an interactive prompt.
fn resolve_password(ctx: &CliContext, flag: Option<String>, confirm: bool) -> Result<String> {
    if let Some(password) = flag.filter(|p| !p.is_empty()) {
        return Ok(password);
    }
    if let Some(password) = ctx.settings.snapshot.resolved_password()? {
        return Ok(password);
    }
    let mut prompt = dialoguer::Password::new().with_prompt("Snapshot password");
    if confirm {
        prompt = prompt.with_confirmation("Repeat password", "Passwords do not match");
    }
    let password = prompt
        .interact()
        .context("no snapshot password configured and none entered")?;
    if password.is_empty() {
        bail!("snapshot password must not be empty");
    }
    Ok(password)
}

fn fingerprint(container: &[u8]) -> String {
    hex::encode(&Sha256::digest(container)[..8])
}

pub fn snapshot_export(ctx: &CliContext, output: &Path, password: &str) -> Result<()> {
    if !ctx.db_path.exists() {
        bail!("database {} does not exist", ctx.db_path.display());
    }
    let size = snapshot::export_database(&ctx.db_path, output, password)?;
    let container = std::fs::read(output)?;
    if ctx.json {
        println!(
            "{}",
            json!({ "path": output, "size": size, "sha256": hex::encode(Sha256::digest(&container)) })
        );
    } else {
        println!(
            "Exported {} ({} bytes, {})",
            output.display().to_string().cyan(),
            size,
            fingerprint(&container).dimmed()
        );
    }
    Ok(())
}

/// Decrypt `container` into `target`. Unless `keep_device_id` is set the
/// restored database becomes a new device.
pub fn snapshot_restore(
    ctx: &CliContext,
    container: &[u8],
    target: &Path,
    password: &str,
    force: bool,
    keep_device_id: bool,
) -> Result<()> {
    let size = snapshot::restore_database(container, target, password, force)
        .with_context(|| format!("Failed to restore snapshot into {}", target.display()))?;
    let db = LocalDb::open(target)
        .with_context(|| format!("Failed to open restored database: {}", target.display()))?;
    let config = if keep_device_id {
        db.sync_config()?
    } else {
        db.adopt_as_new_device()?
    };

    if ctx.json {
        println!(
            "{}",
            json!({ "path": target, "size": size, "device_id": config.device_id })
        );
    } else {
        println!(
            "Restored {} ({} bytes)",
            target.display().to_string().cyan(),
            size
        );
        println!("  Device: {}", config.device_id.dimmed());
        if keep_device_id {
            println!(
                "  {}",
                "Kept the snapshot's device id; do not sync from two installations sharing it"
                    .yellow()
            );
        }
    }
    Ok(())
}

fn server_config(db: &LocalDb) -> Result<SyncConfig> {
    let config = db.sync_config()?;
    if config.server_url.trim().is_empty() {
        bail!("no sync server configured; run 'plf config --server-url <url> --token <token>'");
    }
    Ok(config)
}

async fn snapshot_push(ctx: &CliContext, password: String) -> Result<()> {
    let db = ctx.open_db()?;
    let config = server_config(&db)?;
    let schedule = SnapshotSchedule {
        password,
        every: Duration::ZERO,
        dir: Some(ctx.settings.snapshot.dir.clone()),
        keep: ctx.settings.snapshot.keep,
    };
    let daemon = SyncDaemon::new(db, Arc::new(ctx.transport()?), DaemonOptions::default());
    let size = daemon.upload_snapshot(&config, &schedule).await?;
    if ctx.json {
        println!("{}", json!({ "device_id": config.device_id, "size": size }));
    } else {
        println!(
            "Uploaded snapshot for {} ({} bytes)",
            config.device_id.cyan(),
            size
        );
    }
    Ok(())
}

async fn snapshot_pull(
    ctx: &CliContext,
    device_id: &str,
    target: &Path,
    password: &str,
    force: bool,
    keep_device_id: bool,
) -> Result<()> {
    // Server credentials live in the local database, so it is opened (and
    // created if missing) before the target check.
    let config = server_config(&ctx.open_db()?)?;
    if target.exists() && !force {
        bail!(
            "{} already exists; pass --force to replace it",
            target.display()
        );
    }
    let container = ctx
        .transport()?
        .download_snapshot(&config, device_id)
        .await
        .with_context(|| format!("Failed to download snapshot for {device_id}"))?;
    tracing::debug!(device_id, bytes = container.len(), "downloaded snapshot");
    snapshot_restore(ctx, &container, target, password, force, keep_device_id)
}

fn snapshot_list_local(ctx: &CliContext) -> Result<()> {
    let files = snapshot::list_snapshots(&ctx.settings.snapshot.dir)?;
    if ctx.json {
        println!("{}", serde_json::to_string(&files)?);
        return Ok(());
    }
    if files.is_empty() {
        println!(
            "No snapshots in {}",
            ctx.settings.snapshot.dir.display()
        );
        return Ok(());
    }
    for file in files.iter().rev() {
        let size = std::fs::metadata(file).map(|m| m.len()).unwrap_or(0);
        println!("  {} ({} bytes)", file.display(), size);
    }
    Ok(())
}

async fn snapshot_list_remote(ctx: &CliContext) -> Result<()> {
    let config = server_config(&ctx.open_db()?)?;
    let snapshots = ctx.transport()?.list_snapshots(&config).await?;
    if ctx.json {
        println!("{}", serde_json::to_string(&snapshots)?);
        return Ok(());
    }
    if snapshots.is_empty() {
        println!("No snapshots on {}", config.server_url);
        return Ok(());
    }
    for info in snapshots {
        let marker = if info.device_id == config.device_id {
            " (this device)".green().to_string()
        } else {
            String::new()
        };
        println!(
            "  {}  {} bytes  {}{}",
            info.device_id.cyan(),
            info.size,
            info.uploaded_at.format("%Y-%m-%d %H:%M:%S"),
            marker
        );
    }
    Ok(())
}
