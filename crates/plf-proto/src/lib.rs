use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Header carrying the shared sync secret on every authenticated request.
pub const SYNC_TOKEN_HEADER: &str = "X-Sync-Token";

pub const HEALTH_PATH: &str = "/api/health";
pub const PUSH_PATH: &str = "/api/sync/push";
pub const SNAPSHOTS_PATH: &str = "/api/sync/snapshots";
pub const SNAPSHOT_PATH: &str = "/api/sync/snapshot";

/// Field values of an entity, keyed by field name. Insertion order is kept.
pub type Payload = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "insert" => Some(Operation::Insert),
            "update" => Some(Operation::Update),
            "delete" => Some(Operation::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row identifier, scoped to an entity type. Numeric ids stay numeric on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    Int(i64),
    Text(String),
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Int(id) => write!(f, "{id}"),
            EntityId::Text(id) => f.write_str(id),
        }
    }
}

impl From<i64> for EntityId {
    fn from(id: i64) -> Self {
        EntityId::Int(id)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        EntityId::Text(id.to_string())
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        EntityId::Text(id)
    }
}

/// One captured mutation as it travels from a device to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub change_id: i64,
    pub entity_type: String,
    pub entity_id: EntityId,
    pub operation: Operation,
    #[serde(default)]
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    pub device_id: String,
    pub changes: Vec<ChangeRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResponse {
    pub accepted_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub device_id: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_push_request_accepts_numeric_and_text_ids() {
        let body = json!({
            "device_id": "dev-1",
            "changes": [
                {"change_id": 1, "entity_type": "Local", "entity_id": 99,
                 "operation": "insert", "payload": {"nom": "Local X"}},
                {"change_id": 2, "entity_type": "Booking", "entity_id": "b-7",
                 "operation": "delete"}
            ]
        });
        let req: PushRequest = serde_json::from_value(body).unwrap();
        assert_eq!(req.changes[0].entity_id, EntityId::Int(99));
        assert_eq!(req.changes[0].payload["nom"], "Local X");
        assert_eq!(req.changes[1].entity_id, EntityId::Text("b-7".into()));
        assert_eq!(req.changes[1].operation, Operation::Delete);
        assert!(req.changes[1].payload.is_empty());
    }

    #[test]
    fn test_unknown_operation_is_rejected() {
        let body = json!({"change_id": 1, "entity_type": "X", "entity_id": 1,
                          "operation": "upsert", "payload": {}});
        assert!(serde_json::from_value::<ChangeRecord>(body).is_err());
    }

    #[test]
    fn test_payload_keeps_field_order() {
        let raw = r#"{"zeta":1,"alpha":2,"mid":3}"#;
        let payload: Payload = serde_json::from_str(raw).unwrap();
        let keys: Vec<&str> = payload.keys().map(String::as_str).collect();
        assert_eq!(keys, ["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_operation_parse() {
        assert_eq!(Operation::parse("update"), Some(Operation::Update));
        assert_eq!(Operation::parse("UPDATE"), None);
        assert_eq!(Operation::Insert.to_string(), "insert");
    }
}
