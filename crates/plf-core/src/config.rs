use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings shared by `plf-syncd` and `plf`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub snapshot: SnapshotSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// Local SQLite file
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Maximum number of changes per push
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    /// Pause after the daemon fails to read its own configuration
    #[serde(default = "default_error_backoff")]
    pub error_backoff_seconds: u64,

    /// Synced change-log rows older than this are pruned
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSettings {
    /// Snapshot password, or `${ENV_VAR}` to read it from the environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Upload cadence for daemon snapshots; unset disables them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<u64>,

    #[serde(default = "default_snapshot_dir")]
    pub dir: PathBuf,

    /// Number of local snapshot files to keep
    #[serde(default = "default_keep")]
    pub keep: usize,
}

fn home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_database_path() -> PathBuf {
    home().join(".local").join("share").join("plf").join("plf.db")
}

fn default_snapshot_dir() -> PathBuf {
    home()
        .join(".local")
        .join("share")
        .join("plf")
        .join("snapshots")
}

fn default_batch_size() -> usize {
    100
}

fn default_request_timeout() -> u64 {
    30
}

fn default_error_backoff() -> u64 {
    20
}

fn default_retention_days() -> u32 {
    30
}

fn default_keep() -> usize {
    10
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            request_timeout_seconds: default_request_timeout(),
            error_backoff_seconds: default_error_backoff(),
            retention_days: default_retention_days(),
        }
    }
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            password: None,
            interval_seconds: None,
            dir: default_snapshot_dir(),
            keep: default_keep(),
        }
    }
}

impl SyncSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds.max(1))
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_seconds.max(1))
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }
}

impl SnapshotSettings {
    /// The configured password with `${VAR}` expanded. Empty counts as unset.
    pub fn resolved_password(&self) -> Result<Option<String>> {
        match &self.password {
            Some(raw) => {
                let password = expand_env(raw)?;
                Ok((!password.is_empty()).then_some(password))
            }
            None => Ok(None),
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval_seconds
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
    }
}

/// `~/.config/plf/plf.toml`, or `PLF_CONFIG` when set.
pub fn default_config_path() -> Result<PathBuf> {
    if let Ok(custom) = std::env::var("PLF_CONFIG") {
        return Ok(expand_tilde(Path::new(&custom)));
    }
    let home_dir = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home_dir.join(".config").join("plf").join("plf.toml"))
}

impl Settings {
    /// Load settings from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&default_config_path()?)
    }

    /// Load settings from a specific path. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut settings: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        settings.database.path = expand_tilde(&settings.database.path);
        settings.snapshot.dir = expand_tilde(&settings.snapshot.dir);
        Ok(settings)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, toml_str)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }
}

/// Replace a leading `~/` with the home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.to_str().and_then(|s| s.strip_prefix("~/")) {
        Some(rest) => home().join(rest),
        None => path.to_path_buf(),
    }
}

/// Expand a value of the form `${VAR}` from the environment. Anything else is
/// returned unchanged.
pub fn expand_env(value: &str) -> Result<String> {
    let trimmed = value.trim();
    if let Some(name) = trimmed
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
    {
        if name.is_empty() {
            bail!("empty environment variable reference in {value:?}");
        }
        return std::env::var(name)
            .with_context(|| format!("environment variable {name} is not set"));
    }
    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings.sync.batch_size, 100);
        assert_eq!(settings.sync.error_backoff_seconds, 20);
        assert_eq!(settings.snapshot.keep, 10);
        assert!(settings.snapshot.password.is_none());
    }

    #[test]
    fn test_partial_file_and_tilde() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plf.toml");
        fs::write(
            &path,
            "[database]\npath = \"~/data/plf.db\"\n\n[sync]\nbatch_size = 5\n",
        )
        .unwrap();
        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.sync.batch_size, 5);
        assert_eq!(settings.sync.request_timeout_seconds, 30);
        assert!(!settings.database.path.starts_with("~"));
        assert!(settings.database.path.ends_with("data/plf.db"));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("plf.toml");
        let mut settings = Settings::default();
        settings.snapshot.interval_seconds = Some(3600);
        settings.save_to(&path).unwrap();
        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded.snapshot.interval(), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_expand_env() {
        std::env::set_var("PLF_TEST_SNAPSHOT_PASSWORD", "correct-horse");
        assert_eq!(
            expand_env("${PLF_TEST_SNAPSHOT_PASSWORD}").unwrap(),
            "correct-horse"
        );
        assert_eq!(expand_env("literal").unwrap(), "literal");
        assert!(expand_env("${PLF_TEST_DEFINITELY_UNSET_VAR}").is_err());
        assert!(expand_env("${}").is_err());

        let snapshot = SnapshotSettings {
            password: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(snapshot.resolved_password().unwrap(), None);
    }
}
