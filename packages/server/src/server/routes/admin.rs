//! Queue administration: pause, resume, retry-failed.

use axum::extract::{Extension, Path};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::server::app::AppState;
use crate::server::error::ApiError;

#[derive(Serialize)]
pub struct AckResponse {
    pub status: &'static str,
}

/// `POST /admin/queues/{type}/pause` - stop claiming; active jobs finish.
pub async fn pause_queue(
    Extension(state): Extension<AppState>,
    Path(job_type): Path<String>,
) -> Result<Json<AckResponse>, ApiError> {
    state
        .lifecycle
        .pause(&job_type)
        .map_err(|e| state.error(e))?;
    Ok(Json(AckResponse { status: "paused" }))
}

/// `POST /admin/queues/{type}/resume`
pub async fn resume_queue(
    Extension(state): Extension<AppState>,
    Path(job_type): Path<String>,
) -> Result<Json<AckResponse>, ApiError> {
    state
        .lifecycle
        .resume(&job_type)
        .map_err(|e| state.error(e))?;
    Ok(Json(AckResponse { status: "resumed" }))
}

#[derive(Deserialize, Default)]
pub struct RetryFailedRequest {
    #[serde(rename = "taskType")]
    pub task_type: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryFailedResponse {
    pub retried_count: u64,
}

/// `POST /admin/retry-failed` - re-enqueue parked failed jobs, optionally
/// scoped to one type. Dead jobs are never touched.
pub async fn retry_failed(
    Extension(state): Extension<AppState>,
    body: Option<Json<RetryFailedRequest>>,
) -> Result<Json<RetryFailedResponse>, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let retried_count = state
        .lifecycle
        .retry_failed(request.task_type.as_deref())
        .await
        .map_err(|e| state.error(e))?;
    Ok(Json(RetryFailedResponse { retried_count }))
}
