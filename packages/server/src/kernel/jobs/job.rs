//! Job model for background task execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Default scheduling priority. Lower numeric value means higher priority.
pub const DEFAULT_PRIORITY: i16 = 5;

pub const MIN_PRIORITY: i16 = 1;
pub const MAX_PRIORITY: i16 = 10;

/// Progress is an integer percentage.
pub const MAX_PROGRESS: i16 = 100;

/// Whether a submitted priority is inside the accepted `[1,10]` range.
pub fn priority_in_range(priority: i16) -> bool {
    (MIN_PRIORITY..=MAX_PRIORITY).contains(&priority)
}

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
    /// Reserved: pause is a queue-level flag; the engine never writes this
    /// per-job status. Kept in the enum for wire compatibility.
    Paused,
    Dead,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Delayed => "delayed",
            JobStatus::Paused => "paused",
            JobStatus::Dead => "dead",
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Dead)
    }

    /// The lifecycle state machine.
    ///
    /// `Delayed -> Active` is additionally admitted: a worker may claim a
    /// promoted job before the promoter's durable `delayed -> waiting` write
    /// lands. The durable store stays authoritative either way.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Waiting, Active) => true,
            (Active, Completed) | (Active, Delayed) | (Active, Failed) | (Active, Dead) => true,
            (Delayed, Waiting) | (Delayed, Active) => true,
            (Failed, Waiting) | (Failed, Dead) => true,
            (Paused, Waiting) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry delay growth strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Fixed,
    #[default]
    Exponential,
}

// ============================================================================
// Job model
// ============================================================================

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub priority: i16,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_retries: i32,
    pub progress: i16,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    /// Due time while the job sits in `delayed`.
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new waiting job ready for admission.
    pub fn new(
        job_type: impl Into<String>,
        priority: i16,
        payload: serde_json::Value,
        max_retries: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_type: job_type.into(),
            priority,
            payload,
            status: JobStatus::Waiting,
            attempts: 0,
            max_retries: max_retries as i32,
            progress: 0,
            result: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            failed_at: None,
            scheduled_at: None,
        }
    }

    /// The broker-side representation of this job.
    pub fn envelope(&self) -> Envelope {
        Envelope {
            id: self.id,
            job_type: self.job_type.clone(),
            priority: self.priority,
            payload: self.payload.clone(),
        }
    }
}

/// Runtime representation of a job inside the broker; a superset of the
/// admission body, immutable while an attempt runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub job_type: String,
    pub priority: i16,
    pub payload: serde_json::Value,
}

/// Append-only per-attempt history row (`job_results`).
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub job_id: Uuid,
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration_ms: i64,
    pub attempt_no: i32,
    pub recorded_at: DateTime<Utc>,
}

impl AttemptRecord {
    pub fn success(job_id: Uuid, data: serde_json::Value, duration_ms: i64, attempt_no: i32) -> Self {
        Self {
            job_id,
            success: true,
            data: Some(data),
            error: None,
            duration_ms,
            attempt_no,
            recorded_at: Utc::now(),
        }
    }

    pub fn failure(job_id: Uuid, error: impl Into<String>, duration_ms: i64, attempt_no: i32) -> Self {
        Self {
            job_id,
            success: false,
            data: None,
            error: Some(error.into()),
            duration_ms,
            attempt_no,
            recorded_at: Utc::now(),
        }
    }
}

/// Per-type queue configuration.
#[derive(Debug, Clone, Serialize)]
pub struct QueueConfig {
    pub name: String,
    pub concurrency: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff: Backoff,
    /// Retention: how many completed jobs to keep per type.
    pub keep_completed: u64,
    /// Retention: how many failed/dead jobs to keep per type.
    pub keep_failed: u64,
    /// Optional per-attempt execution timeout.
    pub timeout_ms: Option<u64>,
}

impl QueueConfig {
    /// A minimal config for tests and ad-hoc registrations.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrency: 1,
            max_retries: 3,
            retry_delay_ms: 1_000,
            backoff: Backoff::Exponential,
            keep_completed: 100,
            keep_failed: 500,
            timeout_ms: None,
        }
    }
}
