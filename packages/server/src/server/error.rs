//! API error responses.
//!
//! Body shape is `{error, message?}`; `message` carries detail only when the
//! process runs in development mode.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::common::CoreError;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub error: &'static str,
    pub message: Option<String>,
}

impl ApiError {
    pub fn from_core(err: CoreError, verbose: bool) -> Self {
        let (status, label) = match &err {
            CoreError::Validation(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            CoreError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            CoreError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            CoreError::InvalidTransition { .. }
            | CoreError::TransientInfra(_)
            | CoreError::Fatal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        Self {
            status,
            error: label,
            message: verbose.then(|| err.to_string()),
        }
    }

    pub fn bad_request(message: impl Into<String>, verbose: bool) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: "bad_request",
            message: verbose.then(|| message.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({ "error": self.error });
        if let Some(message) = self.message {
            body["message"] = json!(message);
        }
        (self.status, Json(body)).into_response()
    }
}
