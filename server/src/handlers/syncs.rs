//! Sync operations shared by the HTTP routes and the WebSocket protocol.

use std::sync::Arc;

use soupsync_engine::{Error as EngineError, SyncCallback, SyncConfig, SyncId, SyncState, SyncTarget};

use crate::error::{AppError, Result};
use crate::websocket::{ProgressHub, ServerMessage};
use crate::AppState;

/// Callback that publishes every persisted state of a run to the
/// WebSocket subscribers.
pub fn broadcast_callback(hub: Arc<ProgressHub>) -> SyncCallback {
    Arc::new(move |state: &SyncState| {
        hub.publish(&ServerMessage::sync_update(state));
    })
}

/// Load a sync or fail with `SyncNotFound`.
pub fn get_sync(state: &AppState, sync_id: SyncId) -> Result<SyncState> {
    state
        .manager
        .get_sync_status(sync_id)?
        .ok_or_else(|| AppError::Engine(EngineError::SyncNotFound(sync_id.to_string())))
}

pub fn get_sync_by_name(state: &AppState, name: &str) -> Result<SyncState> {
    state
        .manager
        .get_sync_status_by_name(name)?
        .ok_or_else(|| AppError::Engine(EngineError::SyncNotFound(name.to_string())))
}

/// Record a new sync from its JSON configuration.
pub fn create_sync(state: &AppState, config: SyncConfig) -> Result<SyncState> {
    if config.sync_name.trim().is_empty() {
        return Err(AppError::BadRequest("syncName must not be empty".into()));
    }
    let target = SyncTarget::from_config(config.sync_type, config.target)?;
    let recorded = state.manager.record_sync(
        target,
        config.options,
        &config.soup_name,
        Some(&config.sync_name),
    )?;
    Ok(recorded)
}

/// Start a run in the background and return the state it started with.
///
/// Progress is broadcast to WebSocket clients; the final outcome is only
/// logged here.
pub fn start_sync(state: &AppState, sync_id: SyncId) -> Result<SyncState> {
    let callback = broadcast_callback(state.hub.clone());
    let handle = state.manager.run_sync(sync_id, Some(callback))?;

    tokio::spawn(async move {
        match handle.await {
            Ok(Ok(done)) => {
                tracing::info!(sync_id, status = ?done.status, "Sync run finished");
            }
            Ok(Err(e)) => {
                tracing::warn!(sync_id, "Sync run ended with error: {}", e);
            }
            Err(e) => {
                tracing::error!(sync_id, "Sync task panicked: {}", e);
            }
        }
    });

    get_sync(state, sync_id)
}

/// Ask a running sync to stop. Stopping an idle sync is not an error.
pub fn stop_sync(state: &AppState, sync_id: SyncId) -> Result<SyncState> {
    let current = get_sync(state, sync_id)?;
    if !state.manager.stop_sync(sync_id) {
        tracing::debug!(sync_id, "Stop requested for a sync that is not running");
    }
    Ok(current)
}
