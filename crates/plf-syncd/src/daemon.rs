//! Sync Client Daemon: a single task that wakes once per interval, re-reads
//! `SyncConfig`, and pushes the oldest pending batch.
//!
//! Only ids the server lists in `accepted_ids` are marked synced; everything
//! else stays pending for the next cycle. No failure ends the loop.
//!
//! A batch the server refuses as too large (400 or 413) halves the batch size
//! for the rest of the run. Store access goes through `spawn_blocking`.

use crate::transport::{SyncTransport, TransportError};
use plf_core::{snapshot, CoreError, LocalDb, SyncConfig};
use plf_proto::PushRequest;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const PRUNE_EVERY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Storage(#[from] CoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Snapshot(#[from] snapshot::SnapshotError),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl SyncError {
    /// The server refused the request body, most likely for its size.
    fn is_oversized_batch(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(TransportError::Status {
                status: 400 | 413,
                ..
            })
        )
    }
}

/// Periodic encrypted snapshot of the whole local database.
#[derive(Debug, Clone)]
pub struct SnapshotSchedule {
    pub password: String,
    pub every: Duration,
    /// Also keep rotated copies here when set.
    pub dir: Option<PathBuf>,
    pub keep: usize,
}

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub batch_size: usize,
    pub error_backoff: Duration,
    /// Synced entries older than this are pruned once a day.
    pub retention: Option<chrono::Duration>,
    pub snapshot: Option<SnapshotSchedule>,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            error_backoff: Duration::from_secs(20),
            retention: None,
            snapshot: None,
        }
    }
}

/// Result of one push attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushOutcome {
    pub sent: usize,
    pub accepted: usize,
}

pub struct SyncDaemon {
    db: LocalDb,
    transport: Arc<dyn SyncTransport>,
    options: DaemonOptions,
    batch_limit: usize,
    last_batch: usize,
    last_prune: Option<Instant>,
    last_snapshot: Option<Instant>,
}

/// Returned by [`SyncDaemon::start`]; owns the running task.
pub struct DaemonHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DaemonHandle {
    /// Ask the loop to exit and wait for it. A push already on the wire is
    /// allowed to finish first.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "sync daemon task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl SyncDaemon {
    pub fn new(db: LocalDb, transport: Arc<dyn SyncTransport>, options: DaemonOptions) -> Self {
        Self {
            db,
            transport,
            batch_limit: options.batch_size.max(1),
            last_batch: 0,
            options,
            last_prune: None,
            last_snapshot: None,
        }
    }

    /// Spawn the loop on the current tokio runtime.
    pub fn start(self) -> DaemonHandle {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(self.run(rx));
        DaemonHandle { shutdown, task }
    }

    /// Run until `shutdown` becomes true or its sender is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("sync daemon started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let wait = self.tick().await;
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!("sync daemon stopped");
    }

    /// One cycle. Returns how long to sleep before the next one.
    pub async fn tick(&mut self) -> Duration {
        let config = match self.with_db(|db| db.sync_config()).await {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read sync config, backing off");
                return self.options.error_backoff;
            }
        };
        let interval = config.interval();

        if !config.is_ready() {
            tracing::debug!(enabled = config.enabled, "sync disabled or no server configured");
            return interval;
        }

        self.maybe_prune().await;

        match self.push_pending(&config).await {
            Ok(outcome) if outcome.sent == 0 => tracing::debug!("nothing to sync"),
            Ok(outcome) => tracing::info!(
                device_id = %config.device_id,
                sent = outcome.sent,
                accepted = outcome.accepted,
                "pushed changes"
            ),
            Err(SyncError::Transport(TransportError::Unauthorized)) => {
                tracing::warn!("sync server rejected the token; will retry next cycle")
            }
            Err(e) if e.is_oversized_batch() && self.last_batch > 1 => {
                self.batch_limit = (self.last_batch / 2).max(1);
                tracing::warn!(
                    error = %e,
                    batch_size = self.batch_limit,
                    "sync server refused the batch; shrinking it (check sync.batch_size)"
                );
            }
            Err(e) => tracing::warn!(error = %e, "sync cycle failed; will retry next cycle"),
        }

        self.maybe_snapshot(&config).await;
        interval
    }

    /// Current batch size; starts at `batch_size` and only shrinks.
    pub fn batch_limit(&self) -> usize {
        self.batch_limit
    }

    /// Push the oldest pending batch and mark exactly the accepted ids.
    pub async fn push_pending(&mut self, config: &SyncConfig) -> Result<PushOutcome, SyncError> {
        let limit = self.batch_limit;
        let entries = self.with_db(move |db| db.pending(limit)).await?;
        self.last_batch = entries.len();
        if entries.is_empty() {
            return Ok(PushOutcome::default());
        }
        let request = PushRequest {
            device_id: config.device_id.clone(),
            changes: entries.iter().map(|e| e.to_record()).collect(),
        };
        tracing::debug!(
            count = entries.len(),
            first = entries[0].change_id,
            "pushing batch"
        );
        let response = self.transport.push(config, &request).await?;

        let sent: HashSet<i64> = entries.iter().map(|e| e.change_id).collect();
        let accepted: Vec<i64> = response
            .accepted_ids
            .into_iter()
            .filter(|id| sent.contains(id))
            .collect();
        for rejected in sent.iter().filter(|id| !accepted.contains(*id)) {
            tracing::debug!(change_id = rejected, "change not accepted, left pending");
        }
        let accepted_count = accepted.len();
        self.with_db(move |db| db.mark_synced(&accepted)).await?;
        Ok(PushOutcome {
            sent: entries.len(),
            accepted: accepted_count,
        })
    }

    /// Run a store call on the blocking pool.
    async fn with_db<T, F>(&self, f: F) -> Result<T, SyncError>
    where
        T: Send + 'static,
        F: FnOnce(&LocalDb) -> Result<T, CoreError> + Send + 'static,
    {
        let db = self.db.clone();
        Ok(tokio::task::spawn_blocking(move || f(&db)).await??)
    }

    async fn maybe_prune(&mut self) {
        let Some(retention) = self.options.retention else {
            return;
        };
        if self.last_prune.is_some_and(|at| at.elapsed() < PRUNE_EVERY) {
            return;
        }
        self.last_prune = Some(Instant::now());
        let before = chrono::Utc::now() - retention;
        match self.with_db(move |db| db.prune_synced(before)).await {
            Ok(0) => {}
            Ok(removed) => tracing::info!(removed, "pruned synced change log entries"),
            Err(e) => tracing::warn!(error = %e, "failed to prune change log"),
        }
    }

    async fn maybe_snapshot(&mut self, config: &SyncConfig) {
        let Some(schedule) = self.options.snapshot.clone() else {
            return;
        };
        if self.last_snapshot.is_some_and(|at| at.elapsed() < schedule.every) {
            return;
        }
        self.last_snapshot = Some(Instant::now());
        match self.upload_snapshot(config, &schedule).await {
            Ok(bytes) => tracing::info!(bytes, "uploaded encrypted snapshot"),
            Err(e) => tracing::warn!(error = %e, "snapshot upload failed"),
        }
    }

    /// Encrypt the current database, optionally keep a rotated local copy, and upload it.
    pub async fn upload_snapshot(
        &self,
        config: &SyncConfig,
        schedule: &SnapshotSchedule,
    ) -> Result<usize, SyncError> {
        let db = self.db.clone();
        let password = schedule.password.clone();
        // VACUUM INTO and 200k PBKDF2 rounds both block.
        let container = tokio::task::spawn_blocking(move || {
            let image = db.backup_bytes()?;
            snapshot::encrypt(&image, &password)
        })
        .await??;

        if let Some(dir) = &schedule.dir {
            let path = snapshot::write_rotated(dir, &container, schedule.keep)?;
            tracing::debug!(path = %path.display(), "wrote local snapshot");
        }
        let size = container.len();
        self.transport.upload_snapshot(config, container).await?;
        Ok(size)
    }
}
