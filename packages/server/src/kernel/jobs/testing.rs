//! In-memory `JobStore` implementation.
//!
//! Backs the integration tests and doubles as a storeless dev mode. Mirrors
//! the PostgreSQL implementation's semantics exactly: same transition
//! validation, same patch behavior, same retention ordering.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use super::job::{AttemptRecord, Job, JobStatus};
use super::store::{apply_patch, JobStore, StatusPatch, StoreMetrics};
use crate::common::{CoreError, CoreResult};

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<Uuid, Job>,
    results: Vec<AttemptRecord>,
    metrics: Vec<(String, f64, Option<serde_json::Value>)>,
}

#[derive(Default)]
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded metric samples, for assertions.
    pub fn metric_samples(&self) -> Vec<(String, f64)> {
        let state = self.state.lock().expect("memory store mutex poisoned");
        state
            .metrics
            .iter()
            .map(|(name, value, _)| (name.clone(), *value))
            .collect()
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
impl JobStore for MemoryJobStore {
    async fn create(&self, job: &Job) -> CoreResult<Job> {
        let mut state = self.state.lock().expect("memory store mutex poisoned");
        if state.jobs.contains_key(&job.id) {
            return Err(CoreError::Conflict(job.id));
        }
        state.jobs.insert(job.id, job.clone());
        Ok(job.clone())
    }

    async fn get(&self, id: Uuid) -> CoreResult<Job> {
        let state = self.state.lock().expect("memory store mutex poisoned");
        state.jobs.get(&id).cloned().ok_or(CoreError::NotFound(id))
    }

    async fn list_by_status(&self, status: JobStatus, limit: i64) -> CoreResult<Vec<Job>> {
        let state = self.state.lock().expect("memory store mutex poisoned");
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: JobStatus,
        patch: StatusPatch,
    ) -> CoreResult<Job> {
        let mut state = self.state.lock().expect("memory store mutex poisoned");
        let job = state.jobs.get_mut(&id).ok_or(CoreError::NotFound(id))?;
        Self::check_transition(job, status)?;
        job.status = status;
        apply_patch(job, &patch);
        Ok(job.clone())
    }

    async fn record_attempt(
        &self,
        id: Uuid,
        status: JobStatus,
        patch: StatusPatch,
        outcome: AttemptRecord,
    ) -> CoreResult<Job> {
        let mut state = self.state.lock().expect("memory store mutex poisoned");
        let job = state.jobs.get_mut(&id).ok_or(CoreError::NotFound(id))?;
        Self::check_transition(job, status)?;
        job.status = status;
        apply_patch(job, &patch);
        let updated = job.clone();
        state.results.push(outcome);
        Ok(updated)
    }

    async fn append_result(&self, outcome: &AttemptRecord) -> CoreResult<()> {
        let mut state = self.state.lock().expect("memory store mutex poisoned");
        state.results.push(outcome.clone());
        Ok(())
    }

    async fn set_progress(&self, id: Uuid, progress: i16) -> CoreResult<()> {
        let mut state = self.state.lock().expect("memory store mutex poisoned");
        if let Some(job) = state.jobs.get_mut(&id) {
            if job.status == JobStatus::Active {
                job.progress = progress;
            }
        }
        Ok(())
    }

    async fn results_for(&self, job_id: Uuid) -> CoreResult<Vec<AttemptRecord>> {
        let state = self.state.lock().expect("memory store mutex poisoned");
        Ok(state
            .results
            .iter()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn reset_for_retry(&self, ids: &[Uuid]) -> CoreResult<u64> {
        let mut state = self.state.lock().expect("memory store mutex poisoned");
        let mut moved = 0;
        for id in ids {
            if let Some(job) = state.jobs.get_mut(id) {
                if job.status == JobStatus::Failed {
                    job.status = JobStatus::Waiting;
                    job.scheduled_at = None;
                    job.updated_at = chrono::Utc::now();
                    moved += 1;
                }
            }
        }
        Ok(moved)
    }

    async fn metrics_snapshot(&self) -> CoreResult<StoreMetrics> {
        let state = self.state.lock().expect("memory store mutex poisoned");
        let total = state.jobs.len() as i64;
        let mut completed = 0i64;
        let mut failed = 0i64;
        let mut pending = 0i64;
        let mut processing_seconds = 0.0;
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Completed => {
                    completed += 1;
                    if let (Some(started), Some(done)) = (job.started_at, job.completed_at) {
                        processing_seconds += (done - started).num_milliseconds() as f64 / 1_000.0;
                    }
                }
                JobStatus::Failed | JobStatus::Dead => failed += 1,
                JobStatus::Waiting | JobStatus::Active | JobStatus::Delayed => pending += 1,
                JobStatus::Paused => {}
            }
        }
        let avg_processing_seconds = if completed > 0 {
            processing_seconds / completed as f64
        } else {
            0.0
        };
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
        let mut state = self.state.lock().expect("memory store mutex poisoned");
        let mut deleted = 0u64;

        let trim = |state: &mut MemoryState, terminal: &dyn Fn(JobStatus) -> bool, keep: u64| {
            let mut finished: Vec<(chrono::DateTime<chrono::Utc>, Uuid)> = state
                .jobs
                .values()
                .filter(|j| j.job_type == job_type && terminal(j.status))
                .map(|j| {
                    let at = j
                        .completed_at
                        .or(j.failed_at)
                        .unwrap_or(j.updated_at);
                    (at, j.id)
                })
                .collect();
            // newest first; everything past the keep count is dropped
            finished.sort_by(|a, b| b.0.cmp(&a.0));
            let mut dropped = 0u64;
            for (_, id) in finished.into_iter().skip(keep as usize) {
                state.jobs.remove(&id);
                dropped += 1;
            }
            dropped
        };

        deleted += trim(&mut state, &|s| s == JobStatus::Completed, keep_completed);
        deleted += trim(
            &mut state,
            &|s| matches!(s, JobStatus::Failed | JobStatus::Dead),
            keep_failed,
        );
        Ok(deleted)
    }

    async fn record_metric(
        &self,
        name: &str,
        value: f64,
        metadata: Option<serde_json::Value>,
    ) -> CoreResult<()> {
        let mut state = self.state.lock().expect("memory store mutex poisoned");
        state.metrics.push((name.to_string(), value, metadata));
        Ok(())
    }
}
