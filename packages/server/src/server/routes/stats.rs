//! Broker and system statistics.

use std::collections::HashMap;

use axum::extract::Extension;
use axum::Json;

use crate::kernel::jobs::{QueueStats, SystemMetrics};
use crate::server::app::AppState;
use crate::server::error::ApiError;

/// `GET /stats/queues` - per-queue set cardinalities and pause flags.
pub async fn queue_stats(
    Extension(state): Extension<AppState>,
) -> Json<HashMap<String, QueueStats>> {
    Json(state.lifecycle.broker().stats_all())
}

/// `GET /stats/system` - aggregate metrics snapshot.
pub async fn system_stats(
    Extension(state): Extension<AppState>,
) -> Result<Json<SystemMetrics>, ApiError> {
    let metrics = state.metrics.snapshot().await.map_err(|e| state.error(e))?;
    Ok(Json(metrics))
}
