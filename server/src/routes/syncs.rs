//! Sync endpoint routes.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use soupsync_engine::{SyncConfig, SyncId, SyncState};

use crate::error::Result;
use crate::handlers::syncs;
use crate::AppState;

/// Create sync routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/syncs", get(list_handler).post(create_handler))
        .route("/syncs/by-name/{name}", get(by_name_handler))
        .route("/syncs/{id}", get(get_handler).delete(delete_handler))
        .route("/syncs/{id}/run", post(run_handler))
        .route("/syncs/{id}/stop", post(stop_handler))
        .route("/syncs/{id}/clean-ghosts", post(clean_ghosts_handler))
        .route("/syncs/{id}/mark-failed", post(mark_failed_handler))
}

#[derive(Debug, Deserialize)]
pub struct MarkFailedRequest {
    pub reason: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanGhostsResponse {
    pub sync_id: SyncId,
    pub removed: usize,
}

/// GET /syncs - Every recorded sync.
async fn list_handler(State(state): State<AppState>) -> Result<Json<Vec<SyncState>>> {
    Ok(Json(state.manager.all_syncs()?))
}

/// POST /syncs - Record a sync in status NEW.
async fn create_handler(
    State(state): State<AppState>,
    Json(config): Json<SyncConfig>,
) -> Result<(StatusCode, Json<SyncState>)> {
    let recorded = syncs::create_sync(&state, config)?;
    Ok((StatusCode::CREATED, Json(recorded)))
}

async fn get_handler(
    State(state): State<AppState>,
    Path(id): Path<SyncId>,
) -> Result<Json<SyncState>> {
    Ok(Json(syncs::get_sync(&state, id)?))
}

async fn by_name_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<SyncState>> {
    Ok(Json(syncs::get_sync_by_name(&state, &name)?))
}

async fn delete_handler(
    State(state): State<AppState>,
    Path(id): Path<SyncId>,
) -> Result<StatusCode> {
    state.manager.delete_sync(id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /syncs/{id}/run - Start (or resume) a run in the background.
async fn run_handler(
    State(state): State<AppState>,
    Path(id): Path<SyncId>,
) -> Result<(StatusCode, Json<SyncState>)> {
    let started = syncs::start_sync(&state, id)?;
    Ok((StatusCode::ACCEPTED, Json(started)))
}

async fn stop_handler(
    State(state): State<AppState>,
    Path(id): Path<SyncId>,
) -> Result<Json<SyncState>> {
    Ok(Json(syncs::stop_sync(&state, id)?))
}

/// POST /syncs/{id}/clean-ghosts - Drop local records the server no longer has.
async fn clean_ghosts_handler(
    State(state): State<AppState>,
    Path(id): Path<SyncId>,
) -> Result<Json<CleanGhostsResponse>> {
    let removed = state.manager.clean_resync_ghosts(id).await?;
    Ok(Json(CleanGhostsResponse {
        sync_id: id,
        removed,
    }))
}

async fn mark_failed_handler(
    State(state): State<AppState>,
    Path(id): Path<SyncId>,
    Json(request): Json<MarkFailedRequest>,
) -> Result<Json<SyncState>> {
    Ok(Json(state.manager.mark_failed(id, &request.reason)?))
}
