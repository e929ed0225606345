//! Change Log Store: append-only record of every tracked mutation.
//!
//! `change_id` comes from an AUTOINCREMENT key, so ids only ever grow and are
//! never handed out twice, even after synced rows are pruned.

use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use plf_proto::{ChangeRecord, EntityId, Operation, Payload};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params, Connection, Row, Transaction};

pub(crate) const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS change_log (
    change_id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type TEXT NOT NULL,
    entity_id NOT NULL,
    operation TEXT NOT NULL CHECK (operation IN ('insert', 'update', 'delete')),
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    synced INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_change_log_pending ON change_log (synced, change_id);
";

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeLogEntry {
    pub change_id: i64,
    pub entity_type: String,
    pub entity_id: EntityId,
    pub operation: Operation,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
    pub synced: bool,
}

impl ChangeLogEntry {
    /// Wire form sent to the server.
    pub fn to_record(&self) -> ChangeRecord {
        ChangeRecord {
            change_id: self.change_id,
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id.clone(),
            operation: self.operation,
            payload: self.payload.clone(),
        }
    }

    fn from_row(row: &Row<'_>) -> CoreResult<Self> {
        let operation: String = row.get("operation")?;
        let payload: String = row.get("payload")?;
        Ok(Self {
            change_id: row.get("change_id")?,
            entity_type: row.get("entity_type")?,
            entity_id: entity_id_from_sql(row.get_ref("entity_id")?)?,
            operation: Operation::parse(&operation)
                .ok_or_else(|| CoreError::invalid("operation", operation.clone()))?,
            payload: serde_json::from_str(&payload)?,
            created_at: row.get("created_at")?,
            synced: row.get("synced")?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeLogStats {
    pub pending: u64,
    pub synced: u64,
    pub last_change_id: Option<i64>,
}

/// Numeric ids are stored as INTEGER and text ids as TEXT; the untyped
/// column keeps whichever storage class it was given.
pub(crate) fn entity_id_to_sql(id: &EntityId) -> Value {
    match id {
        EntityId::Int(n) => Value::Integer(*n),
        EntityId::Text(s) => Value::Text(s.clone()),
    }
}

pub(crate) fn entity_id_from_sql(value: ValueRef<'_>) -> CoreResult<EntityId> {
    match value {
        ValueRef::Integer(n) => Ok(EntityId::Int(n)),
        ValueRef::Text(bytes) => Ok(EntityId::Text(String::from_utf8_lossy(bytes).into_owned())),
        other => Err(CoreError::invalid("entity_id", format!("{other:?}"))),
    }
}

/// Append one entry. Taking a [`Transaction`] ties the entry to the domain
/// write it describes: if that transaction rolls back, so does the entry.
pub fn record(
    tx: &Transaction<'_>,
    entity_type: &str,
    entity_id: &EntityId,
    operation: Operation,
    payload: &Payload,
) -> CoreResult<i64> {
    let payload_json = serde_json::to_string(payload)?;
    tx.execute(
        "INSERT INTO change_log (entity_type, entity_id, operation, payload, created_at, synced)
         VALUES (?1, ?2, ?3, ?4, ?5, 0)",
        params![
            entity_type,
            entity_id_to_sql(entity_id),
            operation.as_str(),
            payload_json,
            Utc::now()
        ],
    )?;
    let change_id = tx.last_insert_rowid();
    tracing::debug!(change_id, entity_type, %entity_id, %operation, "recorded change");
    Ok(change_id)
}

/// Up to `limit` unsynced entries, oldest first.
pub fn pending(conn: &Connection, limit: usize) -> CoreResult<Vec<ChangeLogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT change_id, entity_type, entity_id, operation, payload, created_at, synced
         FROM change_log WHERE synced = 0 ORDER BY change_id ASC LIMIT ?1",
    )?;
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let mut rows = stmt.query(params![limit])?;
    let mut entries = Vec::new();
    while let Some(row) = rows.next()? {
        entries.push(ChangeLogEntry::from_row(row)?);
    }
    Ok(entries)
}

/// Flip `synced` for the given ids. Already-synced or unknown ids are ignored.
/// Returns how many rows changed state.
pub fn mark_synced(conn: &mut Connection, change_ids: &[i64]) -> CoreResult<usize> {
    if change_ids.is_empty() {
        return Ok(0);
    }
    let tx = conn.transaction()?;
    let mut flipped = 0;
    {
        let mut stmt =
            tx.prepare("UPDATE change_log SET synced = 1 WHERE change_id = ?1 AND synced = 0")?;
        for id in change_ids {
            flipped += stmt.execute(params![id])?;
        }
    }
    tx.commit()?;
    Ok(flipped)
}

/// Delete synced entries captured before `before`. Pending entries are never touched.
pub fn prune_synced(conn: &Connection, before: DateTime<Utc>) -> CoreResult<usize> {
    let removed = conn.execute(
        "DELETE FROM change_log WHERE synced = 1 AND created_at < ?1",
        params![before],
    )?;
    Ok(removed)
}

pub fn stats(conn: &Connection) -> CoreResult<ChangeLogStats> {
    let (pending, synced, last): (i64, i64, Option<i64>) = conn.query_row(
        "SELECT COALESCE(SUM(synced = 0), 0), COALESCE(SUM(synced = 1), 0), MAX(change_id)
         FROM change_log",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    // Pruning can empty the table; sqlite_sequence still remembers the high-water mark.
    let last_change_id = match last {
        Some(id) => Some(id),
        None => conn
            .query_row(
                "SELECT seq FROM sqlite_sequence WHERE name = 'change_log'",
                [],
                |row| row.get(0),
            )
            .ok(),
    };
    Ok(ChangeLogStats {
        pending: pending.max(0) as u64,
        synced: synced.max(0) as u64,
        last_change_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        conn
    }

    fn payload(v: serde_json::Value) -> Payload {
        v.as_object().cloned().unwrap()
    }

    fn add(conn: &mut Connection, id: EntityId, op: Operation) -> i64 {
        let tx = conn.transaction().unwrap();
        let change_id = record(&tx, "Equipment", &id, op, &payload(json!({"name": "mixer"}))).unwrap();
        tx.commit().unwrap();
        change_id
    }

    #[test]
    fn test_change_ids_increase() {
        let mut conn = open();
        let a = add(&mut conn, EntityId::Int(1), Operation::Insert);
        let b = add(&mut conn, EntityId::Int(1), Operation::Update);
        let c = add(&mut conn, "x".into(), Operation::Delete);
        assert!(a < b && b < c);
    }

    #[test]
    fn test_rolled_back_record_leaves_no_entry() {
        let mut conn = open();
        {
            let tx = conn.transaction().unwrap();
            record(&tx, "Booking", &EntityId::Int(7), Operation::Insert, &Payload::new()).unwrap();
            // dropped without commit
        }
        assert!(pending(&conn, 10).unwrap().is_empty());
    }

    #[test]
    fn test_pending_order_limit_and_types() {
        let mut conn = open();
        let first = add(&mut conn, EntityId::Int(42), Operation::Insert);
        add(&mut conn, "dj-3".into(), Operation::Update);
        add(&mut conn, EntityId::Int(43), Operation::Delete);

        let batch = pending(&conn, 2).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].change_id, first);
        assert_eq!(batch[0].entity_id, EntityId::Int(42));
        assert_eq!(batch[1].entity_id, EntityId::Text("dj-3".into()));
        assert_eq!(batch[0].payload["name"], "mixer");
        assert!(!batch[0].synced);
    }

    #[test]
    fn test_mark_synced_is_idempotent() {
        let mut conn = open();
        let a = add(&mut conn, EntityId::Int(1), Operation::Insert);
        let b = add(&mut conn, EntityId::Int(2), Operation::Insert);

        assert_eq!(mark_synced(&mut conn, &[a]).unwrap(), 1);
        assert_eq!(mark_synced(&mut conn, &[a]).unwrap(), 0);
        assert_eq!(mark_synced(&mut conn, &[a, 999]).unwrap(), 0);

        let left = pending(&conn, 10).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].change_id, b);
    }

    #[test]
    fn test_prune_only_removes_old_synced_rows() {
        let mut conn = open();
        let a = add(&mut conn, EntityId::Int(1), Operation::Insert);
        let b = add(&mut conn, EntityId::Int(2), Operation::Insert);
        mark_synced(&mut conn, &[a]).unwrap();

        assert_eq!(prune_synced(&conn, Utc::now() - chrono::Duration::days(1)).unwrap(), 0);
        assert_eq!(prune_synced(&conn, Utc::now() + chrono::Duration::seconds(1)).unwrap(), 1);

        let left = pending(&conn, 10).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].change_id, b);
    }

    #[test]
    fn test_ids_not_reused_after_prune() {
        let mut conn = open();
        let a = add(&mut conn, EntityId::Int(1), Operation::Insert);
        mark_synced(&mut conn, &[a]).unwrap();
        prune_synced(&conn, Utc::now() + chrono::Duration::seconds(1)).unwrap();

        assert_eq!(stats(&conn).unwrap().last_change_id, Some(a));
        let b = add(&mut conn, EntityId::Int(2), Operation::Insert);
        assert!(b > a);
    }

    #[test]
    fn test_stats() {
        let mut conn = open();
        assert_eq!(stats(&conn).unwrap(), ChangeLogStats::default());
        let a = add(&mut conn, EntityId::Int(1), Operation::Insert);
        let b = add(&mut conn, EntityId::Int(2), Operation::Insert);
        mark_synced(&mut conn, &[a]).unwrap();
        let s = stats(&conn).unwrap();
        assert_eq!(s.pending, 1);
        assert_eq!(s.synced, 1);
        assert_eq!(s.last_change_id, Some(b));
    }
}
