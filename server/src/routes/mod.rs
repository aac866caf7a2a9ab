//! HTTP route definitions.

mod health;
mod soups;
mod syncs;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::Response,
    routing::get,
    Router,
};

use crate::handlers::handle_websocket_connection;
use crate::AppState;

/// Create all application routes.
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .merge(syncs::routes())
        .merge(soups::routes())
        .route("/ws", get(ws_handler))
}

/// GET /ws - Upgrade to the sync progress socket.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_websocket_connection(socket, state))
}
