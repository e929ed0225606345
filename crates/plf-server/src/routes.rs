use crate::apply::ApplyHook;
use crate::auth::{self, TokenDigest};
use crate::config::Settings;
use crate::error::ServerError;
use crate::sync_db::{ChangeStatus, SyncDb};
use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, State},
    http::header,
    middleware,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use plf_proto::{
    PushRequest, PushResponse, SnapshotInfo, HEALTH_PATH, PUSH_PATH, SNAPSHOTS_PATH,
    SNAPSHOT_PATH,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared server state
#[derive(Clone)]
pub struct AppState {
    pub db: SyncDb,
    pub hook: Arc<dyn ApplyHook>,
    pub token: TokenDigest,
    pub max_batch: usize,
    pub max_snapshot_bytes: usize,
}

impl AppState {
    pub fn new(db: SyncDb, hook: Arc<dyn ApplyHook>, settings: &Settings) -> Self {
        Self {
            db,
            hook,
            token: TokenDigest::new(&settings.sync.token),
            max_batch: settings.sync.max_batch,
            max_snapshot_bytes: settings.database.max_snapshot_bytes,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let snapshot_route = format!("{SNAPSHOT_PATH}/{{device_id}}");
    let protected = Router::new()
        .route(PUSH_PATH, post(push_handler))
        .route(SNAPSHOTS_PATH, get(list_snapshots_handler))
        .route(
            &snapshot_route,
            put(upload_snapshot_handler).get(download_snapshot_handler),
        )
        .layer(DefaultBodyLimit::max(state.max_snapshot_bytes))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_sync_token,
        ));

    Router::new()
        .route(HEALTH_PATH, get(health_handler))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> &'static str {
    "OK"
}

// --- Push ---

async fn push_handler(
    State(state): State<AppState>,
    body: Result<Json<PushRequest>, JsonRejection>,
) -> Result<Json<PushResponse>, ServerError> {
    let Json(request) = body.map_err(|rejection| ServerError::BadRequest(rejection.body_text()))?;
    if request.device_id.trim().is_empty() {
        return Err(ServerError::BadRequest("device_id is required".to_string()));
    }
    if request.changes.len() > state.max_batch {
        return Err(ServerError::BadRequest(format!(
            "batch of {} changes exceeds the limit of {}",
            request.changes.len(),
            state.max_batch
        )));
    }

    let mut accepted_ids = Vec::with_capacity(request.changes.len());
    let mut applied = 0usize;
    // Array order is the client's change_id order; apply strictly in sequence.
    for change in &request.changes {
        let status = state
            .db
            .apply_change(&request.device_id, change, state.hook.as_ref())
            .await?;
        match status {
            ChangeStatus::Applied => applied += 1,
            ChangeStatus::Duplicate => tracing::debug!(
                device_id = %request.device_id,
                change_id = change.change_id,
                "duplicate change acknowledged without applying"
            ),
            ChangeStatus::Rejected(ref err) => tracing::warn!(
                device_id = %request.device_id,
                change_id = change.change_id,
                entity_type = %change.entity_type,
                entity_id = %change.entity_id,
                error = %err,
                "change rejected; client will retry"
            ),
        }
        if status.is_accepted() {
            accepted_ids.push(change.change_id);
        }
    }

    tracing::info!(
        device_id = %request.device_id,
        received = request.changes.len(),
        applied,
        accepted = accepted_ids.len(),
        "processed push"
    );
    Ok(Json(PushResponse { accepted_ids }))
}

// --- Snapshot relay ---

async fn upload_snapshot_handler(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    body: Bytes,
) -> Result<Json<SnapshotInfo>, ServerError> {
    if device_id.trim().is_empty() {
        return Err(ServerError::BadRequest("device_id is required".to_string()));
    }
    if !plf_core::snapshot::is_container(&body) {
        return Err(ServerError::BadRequest(
            "body is not a PLF1 snapshot container".to_string(),
        ));
    }
    let info = state.db.save_snapshot(&device_id, &body).await?;
    tracing::info!(device_id = %device_id, size = info.size, "stored snapshot");
    Ok(Json(info))
}

async fn download_snapshot_handler(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    match state.db.get_snapshot(&device_id).await? {
        Some(container) => Ok((
            [(header::CONTENT_TYPE, "application/octet-stream")],
            container,
        )),
        None => Err(ServerError::NotFound(format!(
            "no snapshot stored for device {device_id}"
        ))),
    }
}

async fn list_snapshots_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<SnapshotInfo>>, ServerError> {
    Ok(Json(state.db.list_snapshots().await?))
}
