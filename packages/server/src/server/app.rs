//! Application setup and router assembly.

use std::sync::Arc;

use axum::extract::Extension;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::common::CoreError;
use crate::kernel::jobs::{LifecycleCoordinator, MetricsAggregator};
use crate::server::error::ApiError;
use crate::server::routes::{
    get_task, health_handler, pause_queue, queue_stats, resume_queue, retry_failed, submit_task,
    system_stats,
};

/// Shared state for every route handler.
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<LifecycleCoordinator>,
    pub metrics: Arc<MetricsAggregator>,
    /// Development mode: error responses carry a human-readable message.
    pub verbose_errors: bool,
}

impl AppState {
    pub fn error(&self, err: CoreError) -> ApiError {
        ApiError::from_core(err, self.verbose_errors)
    }

    pub fn bad_request(&self, message: impl Into<String>) -> ApiError {
        ApiError::bad_request(message, self.verbose_errors)
    }
}

/// Build the control-surface router.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/tasks", post(submit_task))
        .route("/tasks/:id", get(get_task))
        .route("/stats/queues", get(queue_stats))
        .route("/stats/system", get(system_stats))
        .route("/admin/queues/:job_type/pause", post(pause_queue))
        .route("/admin/queues/:job_type/resume", post(resume_queue))
        .route("/admin/retry-failed", post(retry_failed))
        .route("/health", get(health_handler))
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
