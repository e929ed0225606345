//! The process-wide `SyncConfig` row.
//!
//! Lives in the local database so the daemon can re-read it every cycle and
//! pick up operator changes without a restart.

use crate::error::CoreResult;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_INTERVAL_SECONDS: u64 = 20;

pub(crate) const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sync_config (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    enabled INTEGER NOT NULL DEFAULT 0,
    sync_interval_seconds INTEGER NOT NULL DEFAULT 20,
    server_url TEXT NOT NULL DEFAULT '',
    device_id TEXT NOT NULL,
    server_token TEXT NOT NULL DEFAULT ''
);
";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub enabled: bool,
    pub sync_interval_seconds: u64,
    pub server_url: String,
    pub device_id: String,
    pub server_token: String,
}

impl SyncConfig {
    /// Sleep between daemon cycles. Never shorter than one second.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_seconds.max(1))
    }

    /// True when enabled and pointed at a server.
    pub fn is_ready(&self) -> bool {
        self.enabled && !self.server_url.trim().is_empty()
    }
}

/// Partial update; `None` leaves a field as it is. `device_id` is not
/// operator-editable.
#[derive(Debug, Clone, Default)]
pub struct SyncConfigUpdate {
    pub enabled: Option<bool>,
    pub sync_interval_seconds: Option<u64>,
    pub server_url: Option<String>,
    pub server_token: Option<String>,
}

impl SyncConfigUpdate {
    pub fn is_empty(&self) -> bool {
        self.enabled.is_none()
            && self.sync_interval_seconds.is_none()
            && self.server_url.is_none()
            && self.server_token.is_none()
    }
}

/// Create the row on first boot: disabled, default interval, fresh device id.
pub fn ensure(conn: &Connection) -> CoreResult<SyncConfig> {
    if let Some(existing) = load_optional(conn)? {
        return Ok(existing);
    }
    let device_id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT OR IGNORE INTO sync_config (id, enabled, sync_interval_seconds, device_id)
         VALUES (1, 0, ?1, ?2)",
        params![DEFAULT_INTERVAL_SECONDS as i64, device_id],
    )?;
    let config = load(conn)?;
    tracing::info!(device_id = %config.device_id, "initialised sync config");
    Ok(config)
}

pub fn load(conn: &Connection) -> CoreResult<SyncConfig> {
    match load_optional(conn)? {
        Some(config) => Ok(config),
        None => Err(rusqlite::Error::QueryReturnedNoRows.into()),
    }
}

fn load_optional(conn: &Connection) -> CoreResult<Option<SyncConfig>> {
    let config = conn
        .query_row(
            "SELECT enabled, sync_interval_seconds, server_url, device_id, server_token
             FROM sync_config WHERE id = 1",
            [],
            |row| {
                let interval: i64 = row.get(1)?;
                Ok(SyncConfig {
                    enabled: row.get(0)?,
                    sync_interval_seconds: interval.max(0) as u64,
                    server_url: row.get(2)?,
                    device_id: row.get(3)?,
                    server_token: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(config)
}

pub fn update(conn: &Connection, changes: &SyncConfigUpdate) -> CoreResult<SyncConfig> {
    let current = ensure(conn)?;
    let interval = changes
        .sync_interval_seconds
        .unwrap_or(current.sync_interval_seconds);
    conn.execute(
        "UPDATE sync_config
         SET enabled = ?1, sync_interval_seconds = ?2, server_url = ?3, server_token = ?4
         WHERE id = 1",
        params![
            changes.enabled.unwrap_or(current.enabled),
            i64::try_from(interval).unwrap_or(i64::MAX),
            changes.server_url.as_deref().unwrap_or(&current.server_url),
            changes
                .server_token
                .as_deref()
                .unwrap_or(&current.server_token),
        ],
    )?;
    load(conn)
}

/// Mint a fresh `device_id`. Used when a restored snapshot becomes a new installation.
pub fn regenerate_device_id(conn: &Connection) -> CoreResult<SyncConfig> {
    ensure(conn)?;
    let device_id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "UPDATE sync_config SET device_id = ?1 WHERE id = 1",
        params![device_id],
    )?;
    load(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        conn
    }

    #[test]
    fn test_first_boot_defaults() {
        let conn = open();
        let config = ensure(&conn).unwrap();
        assert!(!config.enabled);
        assert_eq!(config.sync_interval_seconds, DEFAULT_INTERVAL_SECONDS);
        assert!(config.server_url.is_empty());
        assert!(uuid::Uuid::parse_str(&config.device_id).is_ok());
    }

    #[test]
    fn test_device_id_is_stable() {
        let conn = open();
        let first = ensure(&conn).unwrap();
        let second = ensure(&conn).unwrap();
        assert_eq!(first.device_id, second.device_id);

        let updated = update(
            &conn,
            &SyncConfigUpdate {
                enabled: Some(true),
                server_url: Some("http://localhost:5000".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(updated.device_id, first.device_id);
        assert!(updated.enabled);
        assert!(updated.is_ready());
        assert_eq!(updated.sync_interval_seconds, DEFAULT_INTERVAL_SECONDS);
    }

    #[test]
    fn test_interval_floor() {
        let conn = open();
        let config = update(
            &conn,
            &SyncConfigUpdate {
                sync_interval_seconds: Some(0),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(config.interval(), Duration::from_secs(1));
    }
}
