//! Soupsync Server - local sync host for a soup store.
//!
//! Opens the store of the configured user, records the configured soups and
//! syncs, and exposes HTTP and WebSocket endpoints to run syncs against the
//! remote REST source and to query the local data.

mod config;
mod error;
mod handlers;
mod rest_client;
mod routes;
mod websocket;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use soupsync_engine::{
    SoupStore, StaticIdentity, StoreConfig, StoreRegistry, SyncManager, SyncsConfig, UserScope,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::rest_client::HttpRestClient;
use crate::websocket::ProgressHub;

const DEFAULT_FILTER: &str = "soupsync_server=debug,soupsync_engine=debug,tower_http=debug";
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Handles shared by every request.
#[derive(Clone)]
pub struct AppState {
    pub manager: SyncManager,
    pub store: Arc<SoupStore>,
    pub config: Arc<Config>,
    pub hub: Arc<ProgressHub>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Arc::new(Config::from_env()?);
    let registry = StoreRegistry::new(config.data_dir.clone());
    let state = bootstrap(&registry, config.clone())?;
    let manager = state.manager.clone();

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, org_id = %config.org_id, user_id = %config.user_id, "soupsync server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal(manager))
        .await?;
    Ok(())
}

/// Open the user's store, apply the startup resources and settle syncs
/// left RUNNING by a previous process.
fn bootstrap(
    registry: &StoreRegistry,
    config: Arc<Config>,
) -> Result<AppState, Box<dyn std::error::Error>> {
    let identity = StaticIdentity(UserScope::new(&config.org_id, &config.user_id));
    let store = registry.current_store(&identity)?;

    if let Some(path) = &config.store_config {
        let registered = StoreConfig::from_file(path)?.apply(&store)?;
        tracing::info!(soups = ?registered, path = %path.display(), "store config applied");
    }

    let rest = HttpRestClient::new(&config.instance_url, &config.access_token)?;
    let manager = SyncManager::new(store.clone(), Arc::new(rest))?;

    if let Some(path) = &config.sync_config {
        let recorded = SyncsConfig::from_file(path)?.apply(&manager)?;
        tracing::info!(syncs = ?recorded, path = %path.display(), "syncs config applied");
    }

    // Nothing in this process is running yet, so any RUNNING state is stale
    for sync in manager.all_syncs()? {
        if sync.is_running() {
            tracing::warn!(sync_id = sync.id, "marking abandoned sync failed");
            manager.mark_failed(sync.id, "abandoned")?;
        }
    }

    Ok(AppState {
        manager,
        store,
        config,
        hub: ProgressHub::shared(),
    })
}

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    routes::create_routes()
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Resolve on Ctrl-C once every running sync has stopped.
async fn shutdown_signal(manager: SyncManager) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("cannot listen for shutdown signal: {}", e);
        return;
    }
    tracing::info!("shutdown requested, stopping syncs");
    stop_syncs(&manager).await;
}

/// Stop the manager and wait for the runs in flight to persist STOPPED.
async fn stop_syncs(manager: &SyncManager) {
    manager.stop();
    while !manager.is_stopped() {
        tokio::time::sleep(STOP_POLL_INTERVAL).await;
    }
    tracing::info!("all syncs stopped");
}
