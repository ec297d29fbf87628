//! Core error taxonomy.
//!
//! Every fallible kernel operation surfaces one of these kinds. The HTTP
//! layer maps them onto status codes (`Validation` -> 400, `NotFound` -> 404,
//! everything infrastructural -> 500); handler failures never escape the
//! worker and instead feed the retry engine.

use thiserror::Error;
use uuid::Uuid;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad admission input. Never enqueued.
    #[error("validation error: {0}")]
    Validation(String),

    /// Missing entity.
    #[error("job not found: {0}")]
    NotFound(Uuid),

    /// Duplicate job id on create.
    #[error("job already exists: {0}")]
    Conflict(Uuid),

    /// A status transition forbidden by the lifecycle state machine.
    #[error("invalid status transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: Uuid,
        from: &'static str,
        to: &'static str,
    },

    /// Store or broker connectivity trouble. Retried locally a bounded number
    /// of times before it reaches a caller.
    #[error("transient infrastructure error: {0}")]
    TransientInfra(String),

    /// Startup failure or invariant violation. Aborts the process.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl CoreError {
    pub fn transient(err: impl std::fmt::Display) -> Self {
        Self::TransientInfra(err.to_string())
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::TransientInfra(err.to_string())
    }
}

/// Business-level failure reported by a job handler.
///
/// `retriable` is a hint to the retry engine: the default is `true` (all
/// failures retry until attempts are exhausted); `false` parks the job in
/// `failed` immediately, where only an explicit retry-failed revives it.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub retriable: bool,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: false,
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(err.to_string())
    }
}
