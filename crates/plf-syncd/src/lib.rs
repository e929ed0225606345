pub mod daemon;
pub mod shutdown;
pub mod transport;

pub use daemon::{DaemonHandle, DaemonOptions, PushOutcome, SnapshotSchedule, SyncDaemon, SyncError};
pub use shutdown::shutdown_signal;
pub use transport::{HttpTransport, SyncTransport, TransportError};
