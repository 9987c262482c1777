//! HTTP and websocket surface for the relay service.
//!
//! Routers, the API error envelope, the event-channel websocket endpoint,
//! and server bootstrap. Handlers stay thin: validation plus a call into
//! the lifecycle or knowledge service, with errors mapped onto the shared
//! envelope.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::{get, patch, post};
use axum::Router;
use tokio::net::TcpListener;

use relay_core::current_unix_timestamp_ms;
use relay_events::FanoutHub;
use relay_knowledge::KnowledgeService;
use relay_lifecycle::RequestService;
use relay_store::SqliteStore;

mod api_error;
mod routes;
mod ws;

pub use api_error::ApiError;

#[cfg(test)]
mod tests;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind: String,
}

/// Shared handler state.
pub struct AppState {
    pub requests: Arc<RequestService>,
    pub knowledge: Arc<KnowledgeService>,
    pub store: Arc<SqliteStore>,
    pub hub: Arc<FanoutHub>,
    pub allowed_ws_origin: Option<String>,
    pub started_unix_ms: u64,
}

impl AppState {
    pub fn new(
        requests: Arc<RequestService>,
        knowledge: Arc<KnowledgeService>,
        store: Arc<SqliteStore>,
        hub: Arc<FanoutHub>,
        allowed_ws_origin: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            requests,
            knowledge,
            store,
            hub,
            allowed_ws_origin,
            started_unix_ms: current_unix_timestamp_ms(),
        })
    }
}

/// Builds the full application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/help-requests",
            post(routes::help_requests::create).get(routes::help_requests::list),
        )
        .route(
            "/help-requests/{id}",
            get(routes::help_requests::get_one).delete(routes::help_requests::delete_one),
        )
        .route(
            "/help-requests/{id}/resolve",
            patch(routes::help_requests::resolve),
        )
        .route(
            "/help-requests/{id}/unresolved",
            patch(routes::help_requests::mark_unresolved),
        )
        .route(
            "/knowledge-base",
            get(routes::knowledge::list).post(routes::knowledge::create),
        )
        .route("/knowledge-base/search", get(routes::knowledge::search))
        .route("/knowledge-base/stats", get(routes::knowledge::stats))
        .route(
            "/knowledge-base/{id}",
            patch(routes::knowledge::update).delete(routes::knowledge::delete_one),
        )
        .route("/agent/check-knowledge", post(routes::agent::check_knowledge))
        .route("/agent/escalate", post(routes::agent::escalate))
        .route("/agent/kb-sync", get(routes::agent::kb_sync))
        .route("/agent/track-usage", post(routes::agent::track_usage))
        .route("/dashboard/stats", get(routes::dashboard::stats))
        .route("/dashboard/analytics", get(routes::dashboard::analytics))
        .route("/health", get(routes::health))
        .route("/ws", get(ws::handle_ws_upgrade))
        .with_state(state)
}

/// Binds and serves until ctrl-c.
pub async fn run_server(config: GatewayConfig, state: Arc<AppState>) -> Result<()> {
    let bind_addr = config
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid --bind '{}'", config.bind))?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind relay server on {bind_addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve bound server address")?;
    println!("relay server listening: addr={local_addr} event_channel=/ws");

    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("relay server exited unexpectedly")?;
    Ok(())
}
