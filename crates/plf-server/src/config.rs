use anyhow::{bail, Context};
use plf_core::config::{expand_env, expand_tilde};
use serde::Deserialize;
use std::{fs, path::Path, path::PathBuf};

/// Server configuration loaded from TOML file
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    pub sync: SyncSettings,
    #[serde(default)]
    pub database: DatabaseSettings,
}

/// Network settings for the HTTP server
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    /// Host/interface to bind to, e.g. "127.0.0.1"
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on, e.g. 5000
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncSettings {
    /// Shared device token expected in `X-Sync-Token`; `${VAR}` reads it from the environment
    pub token: String,
    /// Largest accepted push batch
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseSettings {
    /// Server SQLite file holding the incoming log, entities and snapshots
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
    #[serde(default = "default_max_snapshot_bytes")]
    pub max_snapshot_bytes: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_max_batch() -> usize {
    500
}

fn default_database_path() -> PathBuf {
    expand_tilde(Path::new("~/.local/share/plf/server.db"))
}

fn default_max_snapshot_bytes() -> usize {
    256 * 1024 * 1024
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_snapshot_bytes: default_max_snapshot_bytes(),
        }
    }
}

impl Settings {
    /// Load and parse the configuration from the given TOML file path
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml(&data)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_toml(data: &str) -> anyhow::Result<Self> {
        let mut settings: Settings = toml::from_str(data).context("failed to parse config")?;
        settings.sync.token = expand_env(&settings.sync.token).context("sync.token")?;
        if settings.sync.token.trim().is_empty() {
            bail!("sync.token must not be empty");
        }
        settings.database.path = expand_tilde(&settings.database.path);
        Ok(settings)
    }
}
