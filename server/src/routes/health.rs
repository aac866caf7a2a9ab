//! Health check endpoint.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use soupsync_engine::ManagerState;

use crate::AppState;

/// Health check response.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// `accepting`, `stopping` or `stopped`
    pub sync_manager: &'static str,
    pub org_id: String,
    pub user_id: String,
    pub soups: usize,
    pub connections: usize,
}

/// Create health routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/", get(root))
}

fn manager_state(state: ManagerState) -> &'static str {
    match state {
        ManagerState::AcceptingSyncs => "accepting",
        ManagerState::StopRequested => "stopping",
        ManagerState::Stopped => "stopped",
    }
}

/// Health check handler.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        sync_manager: manager_state(state.manager.state()),
        org_id: state.config.org_id.clone(),
        user_id: state.config.user_id.clone(),
        soups: state.store.all_soup_names().len(),
        connections: state.hub.subscriber_count(),
    })
}

/// Root handler.
async fn root() -> &'static str {
    "Soupsync Server"
}
