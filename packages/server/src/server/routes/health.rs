//! Liveness endpoint.

use axum::extract::Extension;
use axum::Json;
use serde::Serialize;

use crate::kernel::jobs::metrics::resident_memory_bytes;
use crate::server::app::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Seconds since process start.
    pub uptime: u64,
    pub memory: MemoryHealth,
}

#[derive(Serialize)]
pub struct MemoryHealth {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rss_bytes: Option<u64>,
}

/// `GET /health` - always `200` while the process serves requests.
pub async fn health_handler(Extension(state): Extension<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime: state.metrics.uptime_seconds(),
        memory: MemoryHealth {
            rss_bytes: resident_memory_bytes(),
        },
    })
}
