use plf_core::snapshot::{self, SnapshotError};
use plf_core::{EntityId, LocalDb, Operation, Payload, SyncConfigUpdate};
use serde_json::json;

fn payload(v: serde_json::Value) -> Payload {
    v.as_object().cloned().unwrap()
}

#[test]
fn inserting_a_tracked_entity_creates_one_log_row() {
    let db = LocalDb::open_in_memory().unwrap();
    db.save_entity("Local", &EntityId::Int(1), &payload(json!({"nom": "Salle A"})))
        .unwrap();

    let pending = db.pending(100).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].entity_type, "Local");
    assert_eq!(pending[0].operation, Operation::Insert);

    let record = pending[0].to_record();
    let wire = serde_json::to_value(&record).unwrap();
    assert_eq!(wire["entity_id"], json!(1));
    assert_eq!(wire["operation"], json!("insert"));
    assert_eq!(wire["payload"], json!({"nom": "Salle A"}));
}

#[test]
fn host_tables_can_share_the_capture_transaction() {
    let db = LocalDb::open_in_memory().unwrap();
    db.write(|tx| -> plf_core::CoreResult<()> {
        tx.execute_batch("CREATE TABLE booking (id INTEGER PRIMARY KEY, client TEXT)")?;
        Ok(())
    })
    .unwrap();

    let change_id = db
        .write(|tx| -> plf_core::CoreResult<i64> {
            tx.execute("INSERT INTO booking (id, client) VALUES (5, 'Dupont')", [])?;
            plf_core::changelog::record(
                tx,
                "Booking",
                &EntityId::Int(5),
                Operation::Insert,
                &payload(json!({"client": "Dupont"})),
            )
        })
        .unwrap();

    let stats = db.stats().unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.last_change_id, Some(change_id));
}

#[test]
fn config_changes_are_visible_through_other_handles() {
    let db = LocalDb::open_in_memory().unwrap();
    let other = db.clone();
    db.update_sync_config(&SyncConfigUpdate {
        enabled: Some(true),
        sync_interval_seconds: Some(1),
        ..Default::default()
    })
    .unwrap();
    let seen = other.sync_config().unwrap();
    assert!(seen.enabled);
    assert_eq!(seen.sync_interval_seconds, 1);
}

#[test]
fn exported_database_restores_elsewhere() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source.db");
    let container = dir.path().join("backup.plf");
    let restored = dir.path().join("restored.db");

    let db = LocalDb::open(&source).unwrap();
    db.save_entity("Equipment", &EntityId::Text("eq-7".into()), &payload(json!({"name": "sub"})))
        .unwrap();
    let device_id = db.sync_config().unwrap().device_id;

    snapshot::export_database(&source, &container, "correct-horse").unwrap();
    let bytes = std::fs::read(&container).unwrap();
    assert!(snapshot::is_container(&bytes));

    let err = snapshot::import_database(&container, &restored, "wrong-horse", false).unwrap_err();
    assert!(matches!(err, SnapshotError::DecryptionFailed));
    assert!(!restored.exists());

    snapshot::import_database(&container, &restored, "correct-horse", false).unwrap();
    let copy = LocalDb::open(&restored).unwrap();
    assert_eq!(copy.sync_config().unwrap().device_id, device_id);
    let entity = copy
        .get_entity("Equipment", &EntityId::Text("eq-7".into()))
        .unwrap()
        .unwrap();
    assert_eq!(entity["name"], "sub");

    let err = snapshot::import_database(&container, &restored, "correct-horse", false).unwrap_err();
    assert!(matches!(err, SnapshotError::TargetExists(_)));
}
