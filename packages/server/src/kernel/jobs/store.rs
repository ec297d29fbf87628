//! Durable job storage.
//!
//! The store is the authoritative record of every job and its attempt
//! history. The broker is rebuilt from it on boot, so every status change
//! lands here before the broker moves.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use super::job::{AttemptRecord, Job, JobStatus};
use crate::common::{CoreError, CoreResult};

/// Optional field updates applied together with a status change.
///
/// `None` leaves a column untouched. `scheduled_at` is double-wrapped so the
/// due time can be cleared when a job leaves `delayed`.
#[derive(Debug, Clone, Default)]
pub struct StatusPatch {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub attempts: Option<i32>,
    pub progress: Option<i16>,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub scheduled_at: Option<Option<DateTime<Utc>>>,
}

impl StatusPatch {
    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn failed_at(mut self, at: DateTime<Utc>) -> Self {
        self.failed_at = Some(at);
        self
    }

    pub fn attempts(mut self, attempts: i32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn progress(mut self, progress: i16) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn last_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    pub fn schedule(mut self, due: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(Some(due));
        self
    }

    pub fn clear_schedule(mut self) -> Self {
        self.scheduled_at = Some(None);
        self
    }
}

/// Apply a patch to an in-memory job row. Shared by the in-memory store so
/// both implementations patch identically.
pub(crate) fn apply_patch(job: &mut Job, patch: &StatusPatch) {
    if let Some(at) = patch.started_at {
        job.started_at = Some(at);
    }
    if let Some(at) = patch.completed_at {
        job.completed_at = Some(at);
    }
    if let Some(at) = patch.failed_at {
        job.failed_at = Some(at);
    }
    if let Some(attempts) = patch.attempts {
        job.attempts = attempts;
    }
    if let Some(progress) = patch.progress {
        job.progress = progress;
    }
    if let Some(result) = &patch.result {
        job.result = Some(result.clone());
    }
    if let Some(error) = &patch.last_error {
        job.last_error = Some(error.clone());
    }
    if let Some(scheduled_at) = patch.scheduled_at {
        job.scheduled_at = scheduled_at;
    }
    job.updated_at = Utc::now();
}

/// Aggregates derived from the `jobs` table.
#[derive(Debug, Clone, Serialize)]
pub struct StoreMetrics {
    pub total: i64,
    pub completed: i64,
    /// Jobs in `failed` or `dead`.
    pub failed: i64,
    /// Jobs in `waiting`, `active`, or `delayed`.
    pub pending: i64,
    pub avg_processing_seconds: f64,
    pub success_rate_pct: f64,
}

impl StoreMetrics {
    pub(crate) fn with_success_rate(
        total: i64,
        completed: i64,
        failed: i64,
        pending: i64,
        avg_processing_seconds: f64,
    ) -> Self {
        let denominator = completed + failed;
        let success_rate_pct = if denominator == 0 {
            0.0
        } else {
            100.0 * completed as f64 / denominator as f64
        };
        Self {
            total,
            completed,
            failed,
            pending,
            avg_processing_seconds,
            success_rate_pct,
        }
    }
}

/// Storage trait for job records, attempt history, and aggregate metrics.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. `Conflict` if the id already exists.
    async fn create(&self, job: &Job) -> CoreResult<Job>;

    async fn get(&self, id: Uuid) -> CoreResult<Job>;

    async fn list_by_status(&self, status: JobStatus, limit: i64) -> CoreResult<Vec<Job>>;

    /// Atomically update status plus any patched columns. Transitions
    /// forbidden by the state machine are rejected server-side.
    async fn update_status(&self, id: Uuid, status: JobStatus, patch: StatusPatch)
        -> CoreResult<Job>;

    /// `update_status` and `append_result` committed in one transaction;
    /// used for every attempt's terminal bookkeeping.
    async fn record_attempt(
        &self,
        id: Uuid,
        status: JobStatus,
        patch: StatusPatch,
        outcome: AttemptRecord,
    ) -> CoreResult<Job>;

    /// Append-only attempt history.
    async fn append_result(&self, outcome: &AttemptRecord) -> CoreResult<()>;

    /// Coalesced progress write; does not bump the status machine.
    async fn set_progress(&self, id: Uuid, progress: i16) -> CoreResult<()>;

    async fn results_for(&self, job_id: Uuid) -> CoreResult<Vec<AttemptRecord>>;

    /// Bulk `failed -> waiting` used by retry-failed. Returns how many rows
    /// actually moved.
    async fn reset_for_retry(&self, ids: &[Uuid]) -> CoreResult<u64>;

    async fn metrics_snapshot(&self) -> CoreResult<StoreMetrics>;

    /// Retention sweep: drop completed and failed/dead rows beyond the keep
    /// counts, newest kept. Returns deleted row count.
    async fn trim_finished(
        &self,
        job_type: &str,
        keep_completed: u64,
        keep_failed: u64,
    ) -> CoreResult<u64>;

    /// Persist one named metric sample.
    async fn record_metric(
        &self,
        name: &str,
        value: f64,
        metadata: Option<serde_json::Value>,
    ) -> CoreResult<()>;
}

// ============================================================================
// PostgreSQL implementation
// ============================================================================

const JOB_COLUMNS: &str = "id, job_type, priority, payload, status, attempts, max_retries, \
     progress, result, last_error, created_at, updated_at, started_at, completed_at, \
     failed_at, scheduled_at";

pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_for_update(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        id: Uuid,
    ) -> CoreResult<Job> {
        let query = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE");
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or(CoreError::NotFound(id))
    }

    async fn apply_update(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        id: Uuid,
        status: JobStatus,
        patch: &StatusPatch,
    ) -> CoreResult<Job> {
        let query = format!(
            r#"
            UPDATE jobs SET
                status = $2,
                updated_at = NOW(),
                started_at = COALESCE($3, started_at),
                completed_at = COALESCE($4, completed_at),
                failed_at = COALESCE($5, failed_at),
                attempts = COALESCE($6, attempts),
                progress = COALESCE($7, progress),
                result = COALESCE($8, result),
                last_error = COALESCE($9, last_error),
                scheduled_at = CASE WHEN $10 THEN $11 ELSE scheduled_at END
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        );
        let job = sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .bind(status)
            .bind(patch.started_at)
            .bind(patch.completed_at)
            .bind(patch.failed_at)
            .bind(patch.attempts)
            .bind(patch.progress)
            .bind(&patch.result)
            .bind(&patch.last_error)
            .bind(patch.scheduled_at.is_some())
            .bind(patch.scheduled_at.flatten())
            .fetch_one(&mut **tx)
            .await?;
        Ok(job)
    }

    async fn insert_result(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        outcome: &AttemptRecord,
    ) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO job_results (job_id, success, data, error, duration_ms, attempt_no, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(outcome.job_id)
        .bind(outcome.success)
        .bind(&outcome.data)
        .bind(&outcome.error)
        .bind(outcome.duration_ms)
        .bind(outcome.attempt_no)
        .bind(outcome.recorded_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    fn check_transition(current: &Job, next: JobStatus) -> CoreResult<()> {
        if current.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(CoreError::InvalidTransition {
                id: current.id,
                from: current.status.as_str(),
                to: next.as_str(),
            })
        }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn create(&self, job: &Job) -> CoreResult<Job> {
        let query = format!(
            r#"
            INSERT INTO jobs (
                id, job_type, priority, payload, status, attempts, max_retries,
                progress, result, last_error, created_at, updated_at, started_at,
                completed_at, failed_at, scheduled_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            RETURNING {JOB_COLUMNS}
            "#
        );
        let inserted = sqlx::query_as::<_, Job>(&query)
            .bind(job.id)
            .bind(&job.job_type)
            .bind(job.priority)
            .bind(&job.payload)
            .bind(job.status)
            .bind(job.attempts)
            .bind(job.max_retries)
            .bind(job.progress)
            .bind(&job.result)
            .bind(&job.last_error)
            .bind(job.created_at)
            .bind(job.updated_at)
            .bind(job.started_at)
            .bind(job.completed_at)
            .bind(job.failed_at)
            .bind(job.scheduled_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    CoreError::Conflict(job.id)
                }
                _ => CoreError::from(e),
            })?;
        Ok(inserted)
    }

    async fn get(&self, id: Uuid) -> CoreResult<Job> {
        let query = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(CoreError::NotFound(id))
    }

    async fn list_by_status(&self, status: JobStatus, limit: i64) -> CoreResult<Vec<Job>> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = $1 ORDER BY created_at ASC LIMIT $2"
        );
        let jobs = sqlx::query_as::<_, Job>(&query)
            .bind(status)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(jobs)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: JobStatus,
        patch: StatusPatch,
    ) -> CoreResult<Job> {
        let mut tx = self.pool.begin().await?;
        let current = Self::fetch_for_update(&mut tx, id).await?;
        Self::check_transition(&current, status)?;
        let job = Self::apply_update(&mut tx, id, status, &patch).await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn record_attempt(
        &self,
        id: Uuid,
        status: JobStatus,
        patch: StatusPatch,
        outcome: AttemptRecord,
    ) -> CoreResult<Job> {
        let mut tx = self.pool.begin().await?;
        let current = Self::fetch_for_update(&mut tx, id).await?;
        Self::check_transition(&current, status)?;
        let job = Self::apply_update(&mut tx, id, status, &patch).await?;
        Self::insert_result(&mut tx, &outcome).await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn append_result(&self, outcome: &AttemptRecord) -> CoreResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::insert_result(&mut tx, outcome).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_progress(&self, id: Uuid, progress: i16) -> CoreResult<()> {
        sqlx::query(
            "UPDATE jobs SET progress = $2, updated_at = NOW() WHERE id = $1 AND status = 'active'",
        )
        .bind(id)
        .bind(progress)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn results_for(&self, job_id: Uuid) -> CoreResult<Vec<AttemptRecord>> {
        let records = sqlx::query_as::<_, AttemptRecord>(
            r#"
            SELECT job_id, success, data, error, duration_ms, attempt_no, recorded_at
            FROM job_results
            WHERE job_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn reset_for_retry(&self, ids: &[Uuid]) -> CoreResult<u64> {
        let moved = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'waiting', scheduled_at = NULL, updated_at = NOW()
            WHERE id = ANY($1) AND status = 'failed'
            "#,
        )
        .bind(ids)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(moved)
    }

    async fn metrics_snapshot(&self) -> CoreResult<StoreMetrics> {
        let (total, completed, failed, pending, avg_processing_seconds): (i64, i64, i64, i64, f64) =
            sqlx::query_as(
                r#"
                SELECT
                    COUNT(*) AS total,
                    COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                    COUNT(*) FILTER (WHERE status IN ('failed', 'dead')) AS failed,
                    COUNT(*) FILTER (WHERE status IN ('waiting', 'active', 'delayed')) AS pending,
                    COALESCE(
                        AVG(EXTRACT(EPOCH FROM (completed_at - started_at)))
                            FILTER (WHERE status = 'completed' AND started_at IS NOT NULL),
                        0
                    )::DOUBLE PRECISION AS avg_processing_seconds
                FROM jobs
                "#,
            )
            .fetch_one(&self.pool)
            .await?;

        Ok(StoreMetrics::with_success_rate(
            total,
            completed,
            failed,
            pending,
            avg_processing_seconds,
        ))
    }

    async fn trim_finished(
        &self,
        job_type: &str,
        keep_completed: u64,
        keep_failed: u64,
    ) -> CoreResult<u64> {
        let completed = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE job_type = $1
              AND status = 'completed'
              AND id NOT IN (
                  SELECT id FROM jobs
                  WHERE job_type = $1 AND status = 'completed'
                  ORDER BY COALESCE(completed_at, updated_at) DESC
                  LIMIT $2
              )
            "#,
        )
        .bind(job_type)
        .bind(keep_completed as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let failed = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE job_type = $1
              AND status IN ('failed', 'dead')
              AND id NOT IN (
                  SELECT id FROM jobs
                  WHERE job_type = $1 AND status IN ('failed', 'dead')
                  ORDER BY COALESCE(failed_at, updated_at) DESC
                  LIMIT $2
              )
            "#,
        )
        .bind(job_type)
        .bind(keep_failed as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(completed + failed)
    }

    async fn record_metric(
        &self,
        name: &str,
        value: f64,
        metadata: Option<serde_json::Value>,
    ) -> CoreResult<()> {
        sqlx::query("INSERT INTO system_metrics (name, value, metadata) VALUES ($1, $2, $3)")
            .bind(name)
            .bind(value)
            .bind(metadata)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_leaves_untouched_fields_alone() {
        let mut job = Job::new("email", 5, serde_json::json!({}), 3);
        let before_created = job.created_at;
        apply_patch(&mut job, &StatusPatch::default().attempts(2));
        assert_eq!(job.attempts, 2);
        assert_eq!(job.created_at, before_created);
        assert!(job.started_at.is_none());
        assert!(job.result.is_none());
    }

    #[test]
    fn patch_sets_and_clears_schedule() {
        let mut job = Job::new("email", 5, serde_json::json!({}), 3);
        let due = Utc::now();
        apply_patch(&mut job, &StatusPatch::default().schedule(due));
        assert_eq!(job.scheduled_at, Some(due));

        apply_patch(&mut job, &StatusPatch::default().clear_schedule());
        assert_eq!(job.scheduled_at, None);
    }

    #[test]
    fn success_rate_guards_zero_denominator() {
        let metrics = StoreMetrics::with_success_rate(5, 0, 0, 5, 0.0);
        assert_eq!(metrics.success_rate_pct, 0.0);
    }

    #[test]
    fn success_rate_counts_dead_as_failed() {
        let metrics = StoreMetrics::with_success_rate(4, 3, 1, 0, 1.5);
        assert_eq!(metrics.success_rate_pct, 75.0);
    }
}
