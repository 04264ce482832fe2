//! HTTP surface for operators: trigger inbox syncs and conversation crawls,
//! poll job status, browse and triage mirrored conversations.

pub mod handlers;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    routing::{get, patch, post},
};
use tracing::info;

use inboxmirror_core::CrawlService;
use inboxmirror_shared::{MirrorError, Result, ServerConfig};

pub use handlers::ApiError;

/// Shared state handed to every handler.
pub struct AppState {
    pub service: Arc<CrawlService>,
}

impl AppState {
    pub fn new(service: Arc<CrawlService>) -> Self {
        Self { service }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/crawl", post(handlers::start_sync))
        .route("/api/crawl-status", get(handlers::sync_status))
        .route("/api/targets", get(handlers::list_targets))
        .route("/api/targets/{key}", get(handlers::get_target))
        .route("/api/targets/{key}/messages", get(handlers::list_messages))
        .route("/api/targets/{key}/status", patch(handlers::set_status))
        .route("/api/targets/{key}/clear-unread", patch(handlers::clear_unread))
        .route("/api/targets/{key}/crawl", post(handlers::start_crawl))
        .route("/api/targets/{key}/crawl-status", get(handlers::crawl_status))
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    config: &ServerConfig,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| MirrorError::config(format!("invalid listen address: {e}")))?;

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| MirrorError::Network(format!("failed to bind {addr}: {e}")))?;
    info!("inboxmirror API listening on {addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| MirrorError::Network(format!("server error: {e}")))
}
