use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use jobrun_core::{ExecutionResult, Job, JobType, Run};
use jobrun_store::{JobSummary, NewJob};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::app::AppState;
use crate::http::ApiError;

const DEFAULT_RUNS_LIMIT: usize = 50;

#[derive(Serialize)]
pub struct JobsResponse {
    pub jobs: Vec<JobSummary>,
}

#[derive(Serialize)]
pub struct JobResponse {
    pub job: Job,
}

#[derive(Serialize)]
pub struct RunsResponse {
    pub runs: Vec<Run>,
}

#[derive(Serialize)]
pub struct TriggerResponse {
    pub result: ExecutionResult,
}

#[derive(Deserialize)]
pub struct RunsQuery {
    pub limit: Option<usize>,
}

/// GET /jobs — all jobs with their latest run status.
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
) -> Result<Json<JobsResponse>, ApiError> {
    let jobs = state.store.jobs().list_with_last_run()?;
    Ok(Json(JobsResponse { jobs }))
}

/// GET /jobs/:id
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = state
        .store
        .jobs()
        .get(&id)?
        .ok_or_else(|| ApiError::not_found(format!("Job not found: {id}")))?;
    Ok(Json(JobResponse { job }))
}

/// GET /jobs/:id/runs?limit=N
pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<RunsResponse>, ApiError> {
    if state.store.jobs().get(&id)?.is_none() {
        return Err(ApiError::not_found(format!("Job not found: {id}")));
    }
    let limit = query.limit.unwrap_or(DEFAULT_RUNS_LIMIT);
    let runs = state.store.runs().list_for_job(&id, limit)?;
    Ok(Json(RunsResponse { runs }))
}

/// POST /jobs — create a job declaration.
///
/// Schedule and (for session jobs) the prompt shape are validated here, at
/// insert time; the registry validates again at registration.
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(new): Json<NewJob>,
) -> Result<(StatusCode, Json<JobResponse>), ApiError> {
    jobrun_scheduler::parse_schedule(&new.schedule)?;
    if new.job_type == JobType::Session {
        jobrun_exec::resolve_prompt(&new.script)
            .map_err(|e| ApiError::bad_request(e.to_string()))?;
    }
    if state.store.jobs().get(&new.id)?.is_some() {
        return Err(ApiError::conflict(format!("Job already exists: {}", new.id)));
    }

    let job = state.store.jobs().insert(&new)?;
    if let Err(e) = state.controller.reconcile_now() {
        warn!(job_id = %job.id, error = %e, "reconcile after create failed");
    }
    Ok((StatusCode::CREATED, Json(JobResponse { job })))
}

/// POST /jobs/:id/run — synchronous manual trigger.
pub async fn trigger_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TriggerResponse>, ApiError> {
    let result = state.controller.trigger_job(&id).await?;
    Ok(Json(TriggerResponse { result }))
}

/// POST /jobs/:id/enable
pub async fn enable_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    set_enabled(&state, &id, true)
}

/// POST /jobs/:id/disable
pub async fn disable_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    set_enabled(&state, &id, false)
}

fn set_enabled(
    state: &AppState,
    id: &str,
    enabled: bool,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !state.store.jobs().set_enabled(id, enabled)? {
        return Err(ApiError::not_found(format!("Job not found: {id}")));
    }
    if let Err(e) = state.controller.reconcile_now() {
        warn!(job_id = %id, error = %e, "reconcile after enable/disable failed");
    }
    Ok(Json(serde_json::json!({ "ok": true })))
}
