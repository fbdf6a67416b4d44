use std::sync::Arc;
use std::time::Instant;

use axum::{
    routing::{get, post},
    Router,
};
use jobrun_core::Config;
use jobrun_scheduler::RunController;
use jobrun_store::Store;

/// Central shared state — passed as `Arc<AppState>` to all Axum handlers.
pub struct AppState {
    pub config: Config,
    pub store: Store,
    pub controller: RunController,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: Config, store: Store, controller: RunController) -> Self {
        Self {
            config,
            store,
            controller,
            started_at: Instant::now(),
        }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health))
        .route(
            "/jobs",
            get(crate::http::jobs::list_jobs).post(crate::http::jobs::create_job),
        )
        .route("/jobs/:id", get(crate::http::jobs::get_job))
        .route("/jobs/:id/runs", get(crate::http::jobs::list_runs))
        .route("/jobs/:id/run", post(crate::http::jobs::trigger_job))
        .route("/jobs/:id/enable", post(crate::http::jobs::enable_job))
        .route("/jobs/:id/disable", post(crate::http::jobs::disable_job))
        .route("/stats", get(crate::http::stats::stats))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
