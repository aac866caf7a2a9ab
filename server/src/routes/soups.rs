//! Read-only access to the local store.

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use soupsync_engine::{IndexSpec, QueryKind, QueryPage, QuerySpec, SoupName};

use crate::error::{AppError, Result};
use crate::AppState;

/// Create soup routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/soups", get(list_handler))
        .route("/soups/{name}/indexes", get(indexes_handler))
        .route("/soups/{name}/query", post(query_handler))
}

/// Body of a soup query.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub query_spec: QuerySpec,
    #[serde(default)]
    pub page_index: usize,
}

async fn list_handler(State(state): State<AppState>) -> Json<Vec<SoupName>> {
    Json(state.store.all_soup_names())
}

async fn indexes_handler(
    State(state): State<AppState>,
    Path(name): Path<SoupName>,
) -> Result<Json<Vec<IndexSpec>>> {
    Ok(Json(state.store.index_specs(&name)?))
}

/// POST /soups/{name}/query - Run one page of a query.
///
/// The soup in the path wins over the one in the query spec, except for smart
/// queries which name their soups in the SQL.
async fn query_handler(
    State(state): State<AppState>,
    Path(name): Path<SoupName>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryPage>> {
    let mut spec = request.query_spec;
    if !matches!(spec.kind, QueryKind::Smart { .. }) {
        spec.soup_name = Some(name);
    }

    let store = state.store.clone();
    let page = tokio::task::spawn_blocking(move || store.query(&spec, request.page_index))
        .await
        .map_err(|e| AppError::Internal(format!("query task failed: {}", e)))??;
    Ok(Json(page))
}
