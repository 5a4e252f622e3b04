//! HTTP server setup and routing

use crate::actuator::BridgeHandle;
use crate::cache::metadata::MetadataStore;
use crate::config::ServerConfig;
use crate::controller::ControllerHandle;
use crate::error::{Error, Result};
use crate::relay::CommandRelay;
use crate::store::StateStore;
use axum::{
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application context passed to all handlers
#[derive(Clone)]
pub struct AppContext {
    pub controller: ControllerHandle,
    pub relay: CommandRelay,
    pub store: Arc<dyn StateStore>,
    pub metadata: Arc<dyn MetadataStore>,
    pub bridge: BridgeHandle,
}

pub fn build_router(ctx: AppContext) -> Router {
    Router::new()
        .route("/health", get(super::handlers::health))
        // Published state
        .route("/state", get(super::handlers::get_state))
        .route("/state/wait", get(super::handlers::wait_state))
        .route("/controller", get(super::handlers::get_controller))
        // Commands and queue
        .route("/commands", post(super::handlers::push_command))
        .route("/queue", post(super::handlers::enqueue))
        .route("/queue/action", post(super::handlers::queue_action))
        // Statistics
        .route("/stats", get(super::handlers::get_stats))
        .with_state(ctx)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Serve the API until `shutdown` resolves
pub async fn run(
    config: &ServerConfig,
    ctx: AppContext,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.bind, config.port)
        .parse()
        .map_err(|e| Error::Config(format!("Invalid bind address {}:{}: {}", config.bind, config.port, e)))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP API listening");

    axum::serve(listener, build_router(ctx))
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("HTTP API stopped");
    Ok(())
}
