pub mod health;
pub mod jobs;
pub mod stats;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use jobrun_scheduler::SchedulerError;
use jobrun_store::StoreError;
use serde_json::json;

/// Uniform `{error: <message>}` body with the status the error class maps to.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        let status = match &e {
            SchedulerError::JobNotFound { .. } => StatusCode::NOT_FOUND,
            SchedulerError::InvalidSchedule(_) => StatusCode::BAD_REQUEST,
            SchedulerError::Backpressure { .. } => StatusCode::TOO_MANY_REQUESTS,
            SchedulerError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match &e {
            StoreError::InvalidTtl(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}
