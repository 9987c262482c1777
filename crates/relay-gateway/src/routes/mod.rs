//! HTTP route handlers.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use relay_core::current_unix_timestamp_ms;

use crate::AppState;

pub(crate) mod agent;
pub(crate) mod dashboard;
pub(crate) mod help_requests;
pub(crate) mod knowledge;

pub(crate) async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let now_unix_ms = current_unix_timestamp_ms();
    Json(json!({
        "status": "healthy",
        "timestamp": now_unix_ms,
        "uptimeSeconds": now_unix_ms.saturating_sub(state.started_unix_ms) / 1_000,
    }))
}
