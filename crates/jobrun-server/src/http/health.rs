use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::app::AppState;

/// GET /health — liveness probe.
///
/// `failedRegistrations` is listed only when some enabled job could not be
/// registered, so a healthy runner keeps the minimal `{ok, uptime}` shape.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let mut body = json!({
        "ok": true,
        "uptime": state.started_at.elapsed().as_secs(),
    });
    let failed = state.controller.failed_registrations();
    if !failed.is_empty() {
        body["failedRegistrations"] = json!(failed);
    }
    Json(body)
}
