//! Apply hooks turn an accepted change into a mutation of the domain store.
//!
//! The sync engine knows nothing about entity schemas; it hands each change to
//! an [`ApplyHook`] on the same connection that records it in the incoming
//! log, so both commit or roll back together.

use async_trait::async_trait;
use chrono::Utc;
use plf_proto::{ChangeRecord, EntityId, Operation, Payload};
use serde_json::Value;
use sqlx::error::ErrorKind;
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use sqlx::Row;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("{entity_type} {entity_id} does not exist")]
    MissingEntity {
        entity_type: String,
        entity_id: String,
    },

    /// The payload points at a row that has not arrived yet.
    #[error("{entity_type}.{field} refers to missing {target_type} {target_id}")]
    MissingReference {
        entity_type: String,
        field: String,
        target_type: String,
        target_id: String,
    },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for ApplyError {
    fn from(err: sqlx::Error) -> Self {
        match err.as_database_error() {
            Some(db) if !matches!(db.kind(), ErrorKind::Other) => ApplyError::Constraint(db.to_string()),
            _ => ApplyError::Database(err),
        }
    }
}

#[async_trait]
pub trait ApplyHook: Send + Sync {
    /// Create whatever tables the hook needs. Called once at startup.
    async fn prepare(&self, _pool: &SqlitePool) -> Result<(), ApplyError> {
        Ok(())
    }

    /// Apply one change. Runs inside the transaction that records it; an error
    /// rolls back both and leaves the change unacknowledged.
    async fn apply(&self, conn: &mut SqliteConnection, change: &ChangeRecord)
        -> Result<(), ApplyError>;
}

/// A foreign key carried inside a JSON payload.
#[derive(Debug, Clone)]
struct Reference {
    entity_type: String,
    field: String,
    target_type: String,
}

/// Default domain collaborator: every entity is a JSON object stored in a
/// schema-less `entities` table.
///
/// * insert writes the payload, replacing any existing row
/// * update merges payload fields into the stored object; the row must exist
/// * delete removes the row and tolerates it being gone already
#[derive(Debug, Clone, Default)]
pub struct JsonEntityStore {
    references: Vec<Reference>,
}

impl JsonEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that `entity_type` payloads hold the id of a `target_type` row
    /// in `field`. Inserts and updates naming a missing target are rejected.
    pub fn with_reference(mut self, entity_type: &str, field: &str, target_type: &str) -> Self {
        self.references.push(Reference {
            entity_type: entity_type.to_string(),
            field: field.to_string(),
            target_type: target_type.to_string(),
        });
        self
    }

    /// Current stored payload of an entity, if any.
    pub async fn fetch(
        pool: &SqlitePool,
        entity_type: &str,
        entity_id: &EntityId,
    ) -> Result<Option<Payload>, ApplyError> {
        let mut conn = pool.acquire().await?;
        load(&mut *conn, entity_type, &entity_id.to_string()).await
    }

    async fn check_references(
        &self,
        conn: &mut SqliteConnection,
        entity_type: &str,
        payload: &Payload,
    ) -> Result<(), ApplyError> {
        for reference in self.references.iter().filter(|r| r.entity_type == entity_type) {
            let target_id = match payload.get(&reference.field) {
                None | Some(Value::Null) => continue,
                Some(Value::Number(n)) => n.to_string(),
                Some(Value::String(s)) => s.clone(),
                Some(other) => {
                    return Err(ApplyError::InvalidPayload(format!(
                        "{}.{} must be an id, got {other}",
                        entity_type, reference.field
                    )))
                }
            };
            let exists = sqlx::query("SELECT 1 FROM entities WHERE entity_type = ? AND entity_id = ?")
                .bind(&reference.target_type)
                .bind(&target_id)
                .fetch_optional(&mut *conn)
                .await?
                .is_some();
            if !exists {
                return Err(ApplyError::MissingReference {
                    entity_type: entity_type.to_string(),
                    field: reference.field.clone(),
                    target_type: reference.target_type.clone(),
                    target_id,
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ApplyHook for JsonEntityStore {
    async fn prepare(&self, pool: &SqlitePool) -> Result<(), ApplyError> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS entities (
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                updated_at TIMESTAMP NOT NULL,
                PRIMARY KEY (entity_type, entity_id)
            )"#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        change: &ChangeRecord,
    ) -> Result<(), ApplyError> {
        let entity_id = change.entity_id.to_string();
        match change.operation {
            Operation::Insert => {
                self.check_references(conn, &change.entity_type, &change.payload)
                    .await?;
                store(conn, &change.entity_type, &entity_id, &change.payload).await
            }
            Operation::Update => {
                let Some(mut current) = load(conn, &change.entity_type, &entity_id).await? else {
                    return Err(ApplyError::MissingEntity {
                        entity_type: change.entity_type.clone(),
                        entity_id,
                    });
                };
                self.check_references(conn, &change.entity_type, &change.payload)
                    .await?;
                for (field, value) in &change.payload {
                    current.insert(field.clone(), value.clone());
                }
                store(conn, &change.entity_type, &entity_id, &current).await
            }
            Operation::Delete => {
                sqlx::query("DELETE FROM entities WHERE entity_type = ? AND entity_id = ?")
                    .bind(&change.entity_type)
                    .bind(&entity_id)
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            }
        }
    }
}

async fn load(
    conn: &mut SqliteConnection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Option<Payload>, ApplyError> {
    let row = sqlx::query("SELECT payload FROM entities WHERE entity_type = ? AND entity_id = ?")
        .bind(entity_type)
        .bind(entity_id)
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some(row) => {
            let body: String = row.get("payload");
            serde_json::from_str(&body)
                .map(Some)
                .map_err(|e| ApplyError::InvalidPayload(e.to_string()))
        }
        None => Ok(None),
    }
}

async fn store(
    conn: &mut SqliteConnection,
    entity_type: &str,
    entity_id: &str,
    payload: &Payload,
) -> Result<(), ApplyError> {
    let body =
        serde_json::to_string(payload).map_err(|e| ApplyError::InvalidPayload(e.to_string()))?;
    sqlx::query(
        r#"INSERT INTO entities (entity_type, entity_id, payload, updated_at)
           VALUES (?, ?, ?, ?)
           ON CONFLICT(entity_type, entity_id) DO UPDATE SET
               payload = excluded.payload,
               updated_at = excluded.updated_at"#,
    )
    .bind(entity_type)
    .bind(entity_id)
    .bind(body)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        JsonEntityStore::new().prepare(&pool).await.unwrap();
        pool
    }

    fn change(id: i64, entity_type: &str, entity_id: EntityId, op: Operation, payload: Value) -> ChangeRecord {
        ChangeRecord {
            change_id: id,
            entity_type: entity_type.to_string(),
            entity_id,
            operation: op,
            payload: payload.as_object().cloned().unwrap_or_default(),
        }
    }

    #[tokio::test]
    async fn test_update_merges_fields() {
        let pool = pool().await;
        let store = JsonEntityStore::new();
        let mut conn = pool.acquire().await.unwrap();
        store
            .apply(&mut *conn, &change(1, "Local", EntityId::Int(1), Operation::Insert, json!({"nom": "A", "ville": "Lyon"})))
            .await
            .unwrap();
        store
            .apply(&mut *conn, &change(2, "Local", EntityId::Int(1), Operation::Update, json!({"nom": "B"})))
            .await
            .unwrap();
        drop(conn);

        let stored = JsonEntityStore::fetch(&pool, "Local", &EntityId::Int(1)).await.unwrap().unwrap();
        assert_eq!(Value::Object(stored), json!({"nom": "B", "ville": "Lyon"}));
    }

    #[tokio::test]
    async fn test_update_of_missing_row_fails() {
        let pool = pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let err = JsonEntityStore::new()
            .apply(&mut *conn, &change(1, "Local", EntityId::Int(9), Operation::Update, json!({"nom": "B"})))
            .await
            .unwrap_err();
        assert!(matches!(err, ApplyError::MissingEntity { .. }));
    }

    #[tokio::test]
    async fn test_delete_tolerates_absence() {
        let pool = pool().await;
        let mut conn = pool.acquire().await.unwrap();
        JsonEntityStore::new()
            .apply(&mut *conn, &change(1, "Local", EntityId::Text("x".into()), Operation::Delete, json!({"id": "x"})))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_reference_rejected() {
        let pool = pool().await;
        let store = JsonEntityStore::new().with_reference("Booking", "local_id", "Local");
        let mut conn = pool.acquire().await.unwrap();
        let booking = change(1, "Booking", EntityId::Int(1), Operation::Insert, json!({"local_id": 5}));

        let err = store.apply(&mut *conn, &booking).await.unwrap_err();
        assert!(matches!(err, ApplyError::MissingReference { ref target_id, .. } if target_id == "5"));

        store
            .apply(&mut *conn, &change(2, "Local", EntityId::Int(5), Operation::Insert, json!({"nom": "Salle"})))
            .await
            .unwrap();
        store.apply(&mut *conn, &booking).await.unwrap();
    }

    #[tokio::test]
    async fn test_reference_must_be_scalar() {
        let pool = pool().await;
        let store = JsonEntityStore::new().with_reference("Booking", "local_id", "Local");
        let mut conn = pool.acquire().await.unwrap();
        let err = store
            .apply(&mut *conn, &change(1, "Booking", EntityId::Int(1), Operation::Insert, json!({"local_id": [1]})))
            .await
            .unwrap_err();
        assert!(matches!(err, ApplyError::InvalidPayload(_)));
    }
}
