use crate::changelog::{self, entity_id_to_sql, ChangeLogEntry, ChangeLogStats};
use crate::error::CoreResult;
use crate::snapshot::{self, SnapshotResult};
use crate::sync_config::{self, SyncConfig, SyncConfigUpdate};
use chrono::{DateTime, Utc};
use plf_proto::{EntityId, Operation, Payload};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const ENTITIES_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS entities (
    entity_type TEXT NOT NULL,
    entity_id NOT NULL,
    payload TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (entity_type, entity_id)
);
";

/// Local SQLite database shared by the host application, the CLI and the
/// sync daemon. Cloning hands out another handle to the same connection.
#[derive(Clone)]
pub struct LocalDb {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for LocalDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDb").field("path", &self.path).finish()
    }
}

impl LocalDb {
    /// Open the database at the given path and initialize tables if needed
    pub fn open(path: &Path) -> CoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init(conn, Some(path.to_path_buf()))
    }

    pub fn open_in_memory() -> CoreResult<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> CoreResult<Self> {
        conn.execute_batch(changelog::SCHEMA)?;
        conn.execute_batch(sync_config::SCHEMA)?;
        conn.execute_batch(ENTITIES_SCHEMA)?;
        sync_config::ensure(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // A panic while holding the lock leaves SQLite itself consistent; any open
    // transaction was rolled back when it was dropped.
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` inside one transaction. Domain writes and the
    /// [`changelog::record`] calls describing them commit together or not at all.
    pub fn write<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, E>,
        E: From<rusqlite::Error>,
    {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Insert or update a tracked entity and capture the change.
    /// Returns the new change id.
    pub fn save_entity(
        &self,
        entity_type: &str,
        entity_id: &EntityId,
        payload: &Payload,
    ) -> CoreResult<i64> {
        let body = serde_json::to_string(payload)?;
        self.write(|tx| {
            let exists = tx
                .query_row(
                    "SELECT 1 FROM entities WHERE entity_type = ?1 AND entity_id = ?2",
                    params![entity_type, entity_id_to_sql(entity_id)],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            tx.execute(
                "INSERT INTO entities (entity_type, entity_id, payload, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(entity_type, entity_id) DO UPDATE SET
                    payload = excluded.payload,
                    updated_at = excluded.updated_at",
                params![entity_type, entity_id_to_sql(entity_id), body, Utc::now()],
            )?;
            let operation = if exists {
                Operation::Update
            } else {
                Operation::Insert
            };
            changelog::record(tx, entity_type, entity_id, operation, payload)
        })
    }

    /// Delete a tracked entity. Returns `None` when there was nothing to delete.
    pub fn delete_entity(&self, entity_type: &str, entity_id: &EntityId) -> CoreResult<Option<i64>> {
        self.write(|tx| {
            let removed = tx.execute(
                "DELETE FROM entities WHERE entity_type = ?1 AND entity_id = ?2",
                params![entity_type, entity_id_to_sql(entity_id)],
            )?;
            if removed == 0 {
                return Ok(None);
            }
            let mut payload = Payload::new();
            payload.insert("id".to_string(), entity_id_value(entity_id));
            changelog::record(tx, entity_type, entity_id, Operation::Delete, &payload).map(Some)
        })
    }

    pub fn get_entity(&self, entity_type: &str, entity_id: &EntityId) -> CoreResult<Option<Payload>> {
        let conn = self.lock();
        let body: Option<String> = conn
            .query_row(
                "SELECT payload FROM entities WHERE entity_type = ?1 AND entity_id = ?2",
                params![entity_type, entity_id_to_sql(entity_id)],
                |row| row.get(0),
            )
            .optional()?;
        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    pub fn pending(&self, limit: usize) -> CoreResult<Vec<ChangeLogEntry>> {
        changelog::pending(&self.lock(), limit)
    }

    pub fn mark_synced(&self, change_ids: &[i64]) -> CoreResult<usize> {
        changelog::mark_synced(&mut self.lock(), change_ids)
    }

    pub fn prune_synced(&self, before: DateTime<Utc>) -> CoreResult<usize> {
        changelog::prune_synced(&self.lock(), before)
    }

    pub fn stats(&self) -> CoreResult<ChangeLogStats> {
        changelog::stats(&self.lock())
    }

    pub fn sync_config(&self) -> CoreResult<SyncConfig> {
        sync_config::load(&self.lock())
    }

    pub fn update_sync_config(&self, changes: &SyncConfigUpdate) -> CoreResult<SyncConfig> {
        sync_config::update(&self.lock(), changes)
    }

    /// Turn a database restored from another installation's snapshot into a
    /// new device: fresh `device_id`, and the inherited change log marked synced
    /// so this device never re-sends the source device's changes.
    pub fn adopt_as_new_device(&self) -> CoreResult<SyncConfig> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let inherited = tx.execute("UPDATE change_log SET synced = 1 WHERE synced = 0", [])?;
        let config = sync_config::regenerate_device_id(&tx)?;
        tx.commit()?;
        tracing::info!(device_id = %config.device_id, inherited, "adopted restored database as new device");
        Ok(config)
    }

    /// Consistent plaintext image of the whole database, ready for
    /// [`snapshot::encrypt`].
    pub fn backup_bytes(&self) -> SnapshotResult<Vec<u8>> {
        snapshot::vacuum_into_bytes(&self.lock())
    }
}

fn entity_id_value(id: &EntityId) -> Value {
    match id {
        EntityId::Int(n) => Value::from(*n),
        EntityId::Text(s) => Value::from(s.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use serde_json::json;

    fn payload(v: Value) -> Payload {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_save_entity_records_insert_then_update() {
        let db = LocalDb::open_in_memory().unwrap();
        let id = EntityId::Int(99);
        let first = db
            .save_entity("Local", &id, &payload(json!({"nom": "Local X"})))
            .unwrap();
        let second = db
            .save_entity("Local", &id, &payload(json!({"nom": "Local Y"})))
            .unwrap();
        assert!(second > first);

        let pending = db.pending(10).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].operation, Operation::Insert);
        assert_eq!(pending[1].operation, Operation::Update);
        assert_eq!(pending[1].payload["nom"], "Local Y");
        assert_eq!(db.get_entity("Local", &id).unwrap().unwrap()["nom"], "Local Y");
    }

    #[test]
    fn test_delete_entity_payload_is_id() {
        let db = LocalDb::open_in_memory().unwrap();
        let id = EntityId::Text("eq-1".into());
        db.save_entity("Equipment", &id, &payload(json!({"name": "mixer"})))
            .unwrap();
        assert!(db.delete_entity("Equipment", &id).unwrap().is_some());
        assert!(db.delete_entity("Equipment", &id).unwrap().is_none());

        let pending = db.pending(10).unwrap();
        let last = pending.last().unwrap();
        assert_eq!(last.operation, Operation::Delete);
        assert_eq!(Value::Object(last.payload.clone()), json!({"id": "eq-1"}));
        assert!(db.get_entity("Equipment", &id).unwrap().is_none());
    }

    #[test]
    fn test_failed_write_commits_nothing() {
        let db = LocalDb::open_in_memory().unwrap();
        let result: CoreResult<()> = db.write(|tx| {
            tx.execute(
                "INSERT INTO entities (entity_type, entity_id, payload, updated_at)
                 VALUES ('Booking', 1, '{}', '2024-01-01')",
                [],
            )?;
            changelog::record(tx, "Booking", &EntityId::Int(1), Operation::Insert, &Payload::new())?;
            Err(CoreError::invalid("payload", "rejected by host"))
        });
        assert!(result.is_err());
        assert!(db.pending(10).unwrap().is_empty());
        assert!(db.get_entity("Booking", &EntityId::Int(1)).unwrap().is_none());
    }

    #[test]
    fn test_failed_record_fails_domain_write() {
        let db = LocalDb::open_in_memory().unwrap();
        db.lock().execute_batch("DROP TABLE change_log").unwrap();
        let err = db.save_entity("Local", &EntityId::Int(1), &Payload::new());
        assert!(err.is_err());
        assert!(db.get_entity("Local", &EntityId::Int(1)).unwrap().is_none());
    }

    #[test]
    fn test_reopen_keeps_device_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("plf.db");
        let device_id = LocalDb::open(&path).unwrap().sync_config().unwrap().device_id;
        let reopened = LocalDb::open(&path).unwrap();
        assert_eq!(reopened.sync_config().unwrap().device_id, device_id);
        assert_eq!(reopened.path(), Some(path.as_path()));
    }

    #[test]
    fn test_adopt_as_new_device() {
        let db = LocalDb::open_in_memory().unwrap();
        let before = db.sync_config().unwrap().device_id;
        db.save_entity("Local", &EntityId::Int(1), &Payload::new()).unwrap();

        let after = db.adopt_as_new_device().unwrap();
        assert_ne!(after.device_id, before);
        assert!(db.pending(10).unwrap().is_empty());

        let next = db.save_entity("Local", &EntityId::Int(2), &Payload::new()).unwrap();
        assert_eq!(db.pending(10).unwrap()[0].change_id, next);
    }

    #[test]
    fn test_backup_bytes_is_sqlite_image() {
        let db = LocalDb::open_in_memory().unwrap();
        db.save_entity("Local", &EntityId::Int(1), &payload(json!({"nom": "A"})))
            .unwrap();
        let image = db.backup_bytes().unwrap();
        assert!(image.starts_with(b"SQLite format 3\0"));
    }
}
