use crate::apply::{ApplyError, ApplyHook};
use chrono::{DateTime, Utc};
use plf_proto::{ChangeRecord, SnapshotInfo};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;

/// What happened to one pushed change.
#[derive(Debug)]
pub enum ChangeStatus {
    /// First time seen; applied and logged.
    Applied,
    /// `(device_id, change_id)` was already in the incoming log.
    Duplicate,
    /// The apply hook refused it; nothing was recorded.
    Rejected(ApplyError),
}

impl ChangeStatus {
    /// Whether the id belongs in `accepted_ids`.
    pub fn is_accepted(&self) -> bool {
        !matches!(self, ChangeStatus::Rejected(_))
    }
}

/// One row of the incoming log.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingEntry {
    pub device_id: String,
    pub change_id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: String,
    pub payload: String,
    pub received_at: DateTime<Utc>,
}

/// Server-side store: the incoming log plus the latest snapshot per device.
#[derive(Clone)]
pub struct SyncDb {
    pool: SqlitePool,
}

impl SyncDb {
    pub async fn open(path: &Path) -> Result<Self, sqlx::Error> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::init(pool).await
    }

    /// Private in-memory database, for tests and throwaway servers.
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::init(pool).await
    }

    async fn init(pool: SqlitePool) -> Result<Self, sqlx::Error> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS incoming_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id TEXT NOT NULL,
                change_id INTEGER NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                payload TEXT NOT NULL,
                received_at TIMESTAMP NOT NULL,
                UNIQUE (device_id, change_id)
            )"#,
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS snapshots (
                device_id TEXT PRIMARY KEY,
                container BLOB NOT NULL,
                size INTEGER NOT NULL,
                uploaded_at TIMESTAMP NOT NULL
            )"#,
        )
        .execute(&pool)
        .await?;
        Ok(SyncDb { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Record and apply one change exactly once per `(device_id, change_id)`.
    ///
    /// The unique-constrained insert into the incoming log is the de-dup check,
    /// so two concurrent retries cannot both get through. The hook then runs in
    /// the same transaction.
    pub async fn apply_change(
        &self,
        device_id: &str,
        change: &ChangeRecord,
        hook: &dyn ApplyHook,
    ) -> Result<ChangeStatus, sqlx::Error> {
        let payload = serde_json::to_string(&change.payload)
            .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            r#"INSERT INTO incoming_log
                   (device_id, change_id, entity_type, entity_id, operation, payload, received_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(device_id, change_id) DO NOTHING"#,
        )
        .bind(device_id)
        .bind(change.change_id)
        .bind(&change.entity_type)
        .bind(change.entity_id.to_string())
        .bind(change.operation.as_str())
        .bind(payload)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(ChangeStatus::Duplicate);
        }

        match hook.apply(&mut *tx, change).await {
            Ok(()) => {
                tx.commit().await?;
                Ok(ChangeStatus::Applied)
            }
            Err(err) => {
                tx.rollback().await?;
                Ok(ChangeStatus::Rejected(err))
            }
        }
    }

    pub async fn incoming_count(&self) -> Result<i64, sqlx::Error> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM incoming_log")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    /// Audit trail for one device, oldest first.
    pub async fn incoming_for_device(&self, device_id: &str) -> Result<Vec<IncomingEntry>, sqlx::Error> {
        let rows = sqlx::query(
            r#"SELECT device_id, change_id, entity_type, entity_id, operation, payload, received_at
               FROM incoming_log WHERE device_id = ? ORDER BY change_id"#,
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| IncomingEntry {
                device_id: row.get("device_id"),
                change_id: row.get("change_id"),
                entity_type: row.get("entity_type"),
                entity_id: row.get("entity_id"),
                operation: row.get("operation"),
                payload: row.get("payload"),
                received_at: row.get::<DateTime<Utc>, _>("received_at"),
            })
            .collect())
    }

    pub async fn save_snapshot(&self, device_id: &str, container: &[u8]) -> Result<SnapshotInfo, sqlx::Error> {
        let uploaded_at = Utc::now();
        sqlx::query(
            r#"INSERT INTO snapshots (device_id, container, size, uploaded_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(device_id) DO UPDATE SET
                   container = excluded.container,
                   size = excluded.size,
                   uploaded_at = excluded.uploaded_at"#,
        )
        .bind(device_id)
        .bind(container)
        .bind(container.len() as i64)
        .bind(uploaded_at)
        .execute(&self.pool)
        .await?;
        Ok(SnapshotInfo {
            device_id: device_id.to_string(),
            size: container.len() as u64,
            uploaded_at,
        })
    }

    pub async fn get_snapshot(&self, device_id: &str) -> Result<Option<Vec<u8>>, sqlx::Error> {
        let row = sqlx::query("SELECT container FROM snapshots WHERE device_id = ?")
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("container")))
    }

    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT device_id, size, uploaded_at FROM snapshots ORDER BY uploaded_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| SnapshotInfo {
                device_id: row.get("device_id"),
                size: row.get::<i64, _>("size").max(0) as u64,
                uploaded_at: row.get::<DateTime<Utc>, _>("uploaded_at"),
            })
            .collect())
    }
}
