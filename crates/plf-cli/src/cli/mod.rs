pub mod commands;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(name = "plf", about = "Offline-first sync for the plf database")]
#[clap(version)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,

    /// Path to the configuration file (defaults to ~/.config/plf/plf.toml)
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the database path from the configuration file
    #[clap(long, global = true)]
    pub database: Option<PathBuf>,

    /// Output in JSON format
    #[clap(long, global = true)]
    pub json: bool,

    /// Verbose logging
    #[clap(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show sync configuration and change log counters
    #[clap(name = "status")]
    Status,

    /// Show or change the sync configuration stored in the database
    #[clap(name = "config")]
    Config(ConfigArgs),

    /// Insert or update an entity and capture the change
    #[clap(name = "record")]
    Record {
        /// Entity type, e.g. Local
        entity_type: String,
        /// Entity id; numeric ids stay numeric
        entity_id: String,
        /// Field values as a JSON object
        payload: String,
    },

    /// Delete an entity and capture the change
    #[clap(name = "delete")]
    Delete {
        entity_type: String,
        entity_id: String,
    },

    /// Print the stored fields of an entity
    #[clap(name = "show")]
    Show {
        entity_type: String,
        entity_id: String,
    },

    /// List change log entries not yet acknowledged by the server
    #[clap(name = "pending")]
    Pending {
        /// Maximum number of entries to show
        #[clap(long, default_value_t = 20)]
        limit: usize,
    },

    /// Remove synced change log entries older than the retention window
    #[clap(name = "prune")]
    Prune {
        /// Retention in days (defaults to sync.retention_days)
        #[clap(long)]
        days: Option<u32>,
    },

    /// Encrypted snapshot export, import and relay
    #[clap(subcommand)]
    Snapshot(SnapshotCommands),
}

#[derive(Args, Clone, Default)]
pub struct ConfigArgs {
    /// Turn the sync daemon on
    #[clap(long, conflicts_with = "disable")]
    pub enable: bool,

    /// Turn the sync daemon off
    #[clap(long)]
    pub disable: bool,

    /// Seconds between sync cycles
    #[clap(long)]
    pub interval: Option<u64>,

    /// Base URL of the sync server, e.g. http://host:5000
    #[clap(long)]
    pub server_url: Option<String>,

    /// Shared secret sent as X-Sync-Token
    #[clap(long)]
    pub token: Option<String>,
}

#[derive(Subcommand, Clone)]
pub enum SnapshotCommands {
    /// Write an encrypted snapshot of the database to a file
    Export {
        /// Output container path
        output: PathBuf,
        /// Snapshot password (defaults to snapshot.password, then a prompt)
        #[clap(long)]
        password: Option<String>,
    },

    /// Restore the database from an encrypted snapshot file
    Import {
        /// Container to restore from
        input: PathBuf,
        /// Replace an existing database
        #[clap(long)]
        force: bool,
        /// Keep the snapshot's device id instead of minting a new one
        #[clap(long)]
        keep_device_id: bool,
        #[clap(long)]
        password: Option<String>,
    },

    /// Encrypt the database and upload it to the sync server
    Push {
        #[clap(long)]
        password: Option<String>,
    },

    /// Download a device's snapshot from the sync server and restore it
    Pull {
        /// Device whose snapshot to fetch
        device_id: String,
        /// Restore here instead of the configured database
        #[clap(long)]
        output: Option<PathBuf>,
        #[clap(long)]
        force: bool,
        #[clap(long)]
        keep_device_id: bool,
        #[clap(long)]
        password: Option<String>,
    },

    /// List local snapshot files, or the server's snapshots with --remote
    List {
        #[clap(long)]
        remote: bool,
    },
}
