pub mod apply;
pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod shutdown;
pub mod sync_db;

pub use apply::{ApplyError, ApplyHook, JsonEntityStore};
pub use config::Settings;
pub use error::ServerError;
pub use routes::{router, AppState};
pub use shutdown::shutdown_signal;
pub use sync_db::{ChangeStatus, SyncDb};
