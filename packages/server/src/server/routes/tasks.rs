//! Task submission and querying.

use axum::extract::{Extension, Path};
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::kernel::jobs::{Job, DEFAULT_PRIORITY};
use crate::server::app::AppState;
use crate::server::error::ApiError;

#[derive(Deserialize)]
pub struct SubmitTaskRequest {
    #[serde(rename = "type")]
    pub task_type: String,
    pub priority: Option<i16>,
    pub data: Option<serde_json::Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitTaskResponse {
    pub task_id: Uuid,
}

/// `POST /tasks` - validate and admit a job. `201 {taskId}` on success.
pub async fn submit_task(
    Extension(state): Extension<AppState>,
    body: Result<Json<SubmitTaskRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitTaskResponse>), ApiError> {
    let Json(request) = body.map_err(|e| state.bad_request(format!("invalid body: {e}")))?;
    let Some(data) = request.data else {
        return Err(state.bad_request("'data' is required"));
    };
    let priority = request.priority.unwrap_or(DEFAULT_PRIORITY);

    let job = state
        .lifecycle
        .submit(&request.task_type, priority, data)
        .await
        .map_err(|e| state.error(e))?;

    Ok((
        StatusCode::CREATED,
        Json(SubmitTaskResponse { task_id: job.id }),
    ))
}

/// `GET /tasks/{id}` - full job record, `404` when unknown.
pub async fn get_task(
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    let job = state.lifecycle.get(id).await.map_err(|e| state.error(e))?;
    Ok(Json(job))
}
