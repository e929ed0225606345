pub mod changelog;
pub mod config;
pub mod database;
pub mod error;
pub mod snapshot;
pub mod sync_config;

// Re-export commonly used types and functions
pub use changelog::{ChangeLogEntry, ChangeLogStats};
pub use config::Settings;
pub use database::LocalDb;
pub use error::{CoreError, CoreResult};
pub use snapshot::SnapshotError;
pub use sync_config::{SyncConfig, SyncConfigUpdate};

pub use plf_proto::{ChangeRecord, EntityId, Operation, Payload};
