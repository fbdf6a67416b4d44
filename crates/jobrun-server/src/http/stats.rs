use std::sync::Arc;

use axum::{extract::State, Json};
use jobrun_core::now_ms;
use serde::Serialize;

use crate::app::AppState;
use crate::http::ApiError;

const HOUR_MS: i64 = 3_600_000;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub total_jobs: i64,
    pub running: usize,
    pub failed_registrations: usize,
    pub ok_last_hour: i64,
    pub errors_last_hour: i64,
}

/// GET /stats — dashboard numbers.
pub async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<StatsResponse>, ApiError> {
    let total_jobs = state.store.jobs().count()?;
    let (ok_last_hour, errors_last_hour) = state.store.runs().counts_since(now_ms() - HOUR_MS)?;
    Ok(Json(StatsResponse {
        total_jobs,
        running: state.controller.running_count(),
        failed_registrations: state.controller.failed_registrations().len(),
        ok_last_hour,
        errors_last_hour,
    }))
}
