//! Job lifecycle coordination.
//!
//! The coordinator owns every status mutation. Each transition is the same
//! sequence: validate, durable update, broker update. The durable store is
//! authoritative; when the broker and store disagree the next claim or
//! promote cycle reconciles them against the store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::broker::Broker;
use super::job::{priority_in_range, AttemptRecord, Job, JobStatus};
use super::registry::HandlerRegistry;
use super::retry::{RetryDecision, RetryPolicy, DEFAULT_BACKOFF_CEILING_MS};
use super::store::{JobStore, StatusPatch};
use crate::common::{CoreError, CoreResult, HandlerError};

/// How many times a store or broker call is retried locally before the
/// failure surfaces as `TransientInfra`.
const INFRA_RETRIES: u32 = 3;
const INFRA_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Upper bound on rows touched per status when rebuilding the broker.
const RECOVERY_BATCH: i64 = 10_000;

pub struct LifecycleCoordinator {
    store: Arc<dyn JobStore>,
    broker: Arc<Broker>,
    registry: Arc<HandlerRegistry>,
    backoff_ceiling_ms: u64,
    stale_threshold_ms: u64,
}

impl LifecycleCoordinator {
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<Broker>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            store,
            broker,
            registry,
            backoff_ceiling_ms: DEFAULT_BACKOFF_CEILING_MS,
            stale_threshold_ms: 60_000,
        }
    }

    pub fn with_tuning(mut self, backoff_ceiling_ms: u64, stale_threshold_ms: u64) -> Self {
        self.backoff_ceiling_ms = backoff_ceiling_ms;
        self.stale_threshold_ms = stale_threshold_ms;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    fn policy_for(&self, job_type: &str) -> RetryPolicy {
        match self.registry.config(job_type) {
            Some(config) => RetryPolicy::from_queue(config, self.backoff_ceiling_ms),
            // Unregistered types only appear via manual rows; fall back to a
            // conservative no-retry policy.
            None => RetryPolicy {
                max_retries: 0,
                retry_delay_ms: 0,
                backoff: super::job::Backoff::Fixed,
                ceiling_ms: self.backoff_ceiling_ms,
            },
        }
    }

    /// Validate and admit a new job: durable record first, then the broker's
    /// ready set.
    pub async fn submit(
        &self,
        job_type: &str,
        priority: i16,
        payload: serde_json::Value,
    ) -> CoreResult<Job> {
        let Some(config) = self.registry.config(job_type) else {
            return Err(CoreError::Validation(format!(
                "unknown task type: {job_type}"
            )));
        };
        if !priority_in_range(priority) {
            return Err(CoreError::Validation(format!(
                "priority must be between 1 and 10, got {priority}"
            )));
        }

        let job = Job::new(job_type, priority, payload, config.max_retries);
        let created = with_retries(|| self.store.create(&job)).await?;
        self.broker.enqueue(created.envelope(), None)?;

        info!(job_id = %created.id, job_type = %created.job_type, priority = created.priority, "job submitted");
        Ok(created)
    }

    pub async fn get(&self, id: Uuid) -> CoreResult<Job> {
        with_retries(|| self.store.get(id)).await
    }

    /// `waiting -> active` for a claimed envelope: stamps `started_at`,
    /// increments `attempts`, resets `progress`.
    pub async fn mark_active(&self, id: Uuid) -> CoreResult<Job> {
        let current = with_retries(|| self.store.get(id)).await?;
        let patch = StatusPatch::default()
            .started_at(Utc::now())
            .attempts(current.attempts + 1)
            .progress(0)
            .clear_schedule();
        let job = with_retries(|| self.store.update_status(id, JobStatus::Active, patch.clone()))
            .await?;
        debug!(job_id = %id, attempt = job.attempts, "job active");
        Ok(job)
    }

    /// Terminal success: durable status + attempt history in one
    /// transaction, then drop the envelope from the broker.
    pub async fn mark_completed(
        &self,
        job: &Job,
        result: serde_json::Value,
        duration_ms: i64,
    ) -> CoreResult<Job> {
        let patch = StatusPatch::default()
            .completed_at(Utc::now())
            .progress(100)
            .result(result.clone());
        let outcome = AttemptRecord::success(job.id, result, duration_ms, job.attempts);
        let updated = with_retries(|| {
            self.store
                .record_attempt(job.id, JobStatus::Completed, patch.clone(), outcome.clone())
        })
        .await?;
        self.broker.ack(&job.job_type, job.id)?;

        info!(job_id = %job.id, job_type = %job.job_type, duration_ms, "job completed");
        Ok(updated)
    }

    /// Failed attempt: the retry engine picks delayed retry, parking in
    /// `failed`, or terminal `dead`; store commits before the broker moves.
    pub async fn mark_failed(
        &self,
        job: &Job,
        error: &HandlerError,
        duration_ms: i64,
    ) -> CoreResult<RetryDecision> {
        let policy = self.policy_for(&job.job_type);
        let decision = policy.decide(job.attempts.max(0) as u32, error.retriable);
        let outcome = AttemptRecord::failure(job.id, error.message.clone(), duration_ms, job.attempts);

        match decision {
            RetryDecision::Retry { delay_ms } => {
                let due = Utc::now() + chrono::Duration::milliseconds(delay_ms as i64);
                let patch = StatusPatch::default()
                    .last_error(error.message.clone())
                    .schedule(due);
                with_retries(|| {
                    self.store
                        .record_attempt(job.id, JobStatus::Delayed, patch.clone(), outcome.clone())
                })
                .await?;
                self.broker.fail(&job.job_type, job.id, Some(delay_ms))?;
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempt = job.attempts,
                    retry_in_ms = delay_ms,
                    error = %error.message,
                    "job failed, retry scheduled"
                );
            }
            RetryDecision::Park => {
                let patch = StatusPatch::default()
                    .last_error(error.message.clone())
                    .failed_at(Utc::now());
                with_retries(|| {
                    self.store
                        .record_attempt(job.id, JobStatus::Failed, patch.clone(), outcome.clone())
                })
                .await?;
                self.broker.fail(&job.job_type, job.id, None)?;
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempt = job.attempts,
                    error = %error.message,
                    "job failed permanently, parked for manual retry"
                );
            }
            RetryDecision::Dead => {
                let patch = StatusPatch::default()
                    .last_error(error.message.clone())
                    .failed_at(Utc::now());
                with_retries(|| {
                    self.store
                        .record_attempt(job.id, JobStatus::Dead, patch.clone(), outcome.clone())
                })
                .await?;
                self.broker.discard(&job.job_type, job.id)?;
                error!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    total_attempts = job.attempts,
                    error = %error.message,
                    "job dead: retries exhausted"
                );
            }
        }
        Ok(decision)
    }

    /// Persist a coalesced progress value. Best effort; progress is
    /// presentation state, not part of the status machine.
    pub async fn set_progress(&self, id: Uuid, progress: i16) {
        if let Err(e) = self.store.set_progress(id, progress).await {
            debug!(job_id = %id, error = %e, "progress write failed");
        }
    }

    /// Promote due delayed jobs into ready, then commit the durable
    /// `delayed -> waiting` writes.
    pub async fn promote_due(&self, job_type: &str) -> CoreResult<usize> {
        let promoted = self.broker.promote_due(job_type, Utc::now())?;
        for id in &promoted {
            let patch = StatusPatch::default().clear_schedule();
            match self.store.update_status(*id, JobStatus::Waiting, patch).await {
                Ok(_) => {}
                // A worker can claim a promoted job before this write lands;
                // the claim's `delayed -> active` transition is legal, so an
                // invalid-transition error here just means we lost that race.
                Err(CoreError::InvalidTransition { .. }) => {}
                Err(e) => warn!(job_id = %id, error = %e, "promote write failed"),
            }
        }
        Ok(promoted.len())
    }

    /// Queue-level pause. Jobs already active are never interrupted.
    pub fn pause(&self, job_type: &str) -> CoreResult<()> {
        self.broker.pause(job_type)?;
        info!(job_type, "queue paused");
        Ok(())
    }

    pub fn resume(&self, job_type: &str) -> CoreResult<()> {
        self.broker.resume(job_type)?;
        info!(job_type, "queue resumed");
        Ok(())
    }

    /// Re-enqueue parked failed jobs (`failed -> waiting`), durable first.
    /// Dead jobs are never touched. Returns how many moved.
    pub async fn retry_failed(&self, job_type: Option<&str>) -> CoreResult<u64> {
        let ids = self.broker.failed_snapshot(job_type)?;
        if ids.is_empty() {
            return Ok(0);
        }
        let moved = with_retries(|| self.store.reset_for_retry(&ids)).await?;
        self.broker.retry_all_failed(job_type)?;
        if moved as usize != ids.len() {
            warn!(
                broker_failed = ids.len(),
                durable_moved = moved,
                "retry-failed: broker and store disagreed; store wins"
            );
        }
        info!(count = moved, "failed jobs re-enqueued");
        Ok(moved)
    }

    /// Rebuild broker state from the durable store on boot.
    ///
    /// - `active` records older than the stale threshold are treated as a
    ///   failed attempt and routed through the retry engine.
    /// - `waiting` and `delayed` rows are re-inserted into the broker.
    /// - `failed` rows populate the broker's failed set, awaiting an
    ///   explicit retry-failed.
    pub async fn recover(&self) -> CoreResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let stale_before =
            Utc::now() - chrono::Duration::milliseconds(self.stale_threshold_ms as i64);

        for job in self
            .store
            .list_by_status(JobStatus::Active, RECOVERY_BATCH)
            .await?
        {
            let stale = job.started_at.map_or(true, |t| t < stale_before);
            if !stale {
                report.active_left += 1;
                continue;
            }
            let policy = self.policy_for(&job.job_type);
            let outcome = AttemptRecord::failure(
                job.id,
                "attempt interrupted: no result recorded before restart",
                0,
                job.attempts,
            );
            match policy.decide(job.attempts.max(0) as u32, true) {
                RetryDecision::Retry { delay_ms } => {
                    let due = Utc::now() + chrono::Duration::milliseconds(delay_ms as i64);
                    let patch = StatusPatch::default()
                        .last_error("attempt interrupted: no result recorded before restart")
                        .schedule(due);
                    self.store
                        .record_attempt(job.id, JobStatus::Delayed, patch, outcome)
                        .await?;
                    self.broker.enqueue_delayed_until(job.envelope(), due)?;
                    report.requeued += 1;
                }
                // recovery failures are always retriable, Park cannot happen
                RetryDecision::Park | RetryDecision::Dead => {
                    let patch = StatusPatch::default()
                        .last_error("attempt interrupted: retries exhausted")
                        .failed_at(Utc::now());
                    self.store
                        .record_attempt(job.id, JobStatus::Dead, patch, outcome)
                        .await?;
                    report.dead += 1;
                }
            }
        }

        for job in self
            .store
            .list_by_status(JobStatus::Waiting, RECOVERY_BATCH)
            .await?
        {
            self.broker.enqueue(job.envelope(), None)?;
            report.requeued += 1;
        }

        for job in self
            .store
            .list_by_status(JobStatus::Delayed, RECOVERY_BATCH)
            .await?
        {
            let due = job.scheduled_at.unwrap_or_else(Utc::now);
            self.broker.enqueue_delayed_until(job.envelope(), due)?;
            report.requeued += 1;
        }

        for job in self
            .store
            .list_by_status(JobStatus::Failed, RECOVERY_BATCH)
            .await?
        {
            self.broker.enqueue_failed(job.envelope())?;
            report.parked += 1;
        }

        info!(
            requeued = report.requeued,
            parked = report.parked,
            dead = report.dead,
            active_left = report.active_left,
            "recovery complete"
        );
        Ok(report)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Jobs put back into ready or delayed sets.
    pub requeued: usize,
    /// Failed jobs parked in the broker's failed set.
    pub parked: usize,
    /// Stale active jobs whose retries were exhausted.
    pub dead: usize,
    /// Fresh active jobs left for their owning worker.
    pub active_left: usize,
}

/// Retry transient infrastructure failures with a short fixed backoff.
/// Anything that is not `TransientInfra` surfaces immediately.
async fn with_retries<T, F, Fut>(op: F) -> CoreResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = CoreResult<T>>,
{
    let mut last = String::new();
    for attempt in 0..INFRA_RETRIES {
        match op().await {
            Ok(value) => return Ok(value),
            Err(CoreError::TransientInfra(msg)) => {
                debug!(attempt, error = %msg, "transient infrastructure error, retrying");
                last = msg;
                tokio::time::sleep(INFRA_RETRY_BACKOFF).await;
            }
            Err(other) => return Err(other),
        }
    }
    Err(CoreError::TransientInfra(last))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::registry::{HandlerContext, JobHandler};
    use crate::kernel::jobs::testing::MemoryJobStore;
    use crate::kernel::jobs::{Backoff, Envelope, QueueConfig};
    use async_trait::async_trait;

    struct NoopHandler;

    #[async_trait]
    impl JobHandler for NoopHandler {
        async fn run(
            &self,
            _envelope: &Envelope,
            _ctx: HandlerContext,
        ) -> Result<serde_json::Value, HandlerError> {
            Ok(serde_json::json!({}))
        }
    }

    fn fixture(max_retries: u32) -> LifecycleCoordinator {
        let mut registry = HandlerRegistry::new();
        let config = QueueConfig {
            max_retries,
            retry_delay_ms: 10,
            backoff: Backoff::Fixed,
            ..QueueConfig::named("email")
        };
        registry.register(config, Arc::new(NoopHandler));
        let registry = Arc::new(registry);
        let broker = Arc::new(Broker::new(["email".to_string()]));
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        LifecycleCoordinator::new(store, broker, registry)
    }

    #[tokio::test]
    async fn submit_rejects_unknown_type() {
        let lc = fixture(3);
        let err = lc.submit("bogus", 5, serde_json::json!({})).await;
        assert!(matches!(err, Err(CoreError::Validation(_))));
    }

    #[tokio::test]
    async fn submit_rejects_out_of_range_priority() {
        let lc = fixture(3);
        for priority in [0, 11] {
            let err = lc.submit("email", priority, serde_json::json!({})).await;
            assert!(matches!(err, Err(CoreError::Validation(_))));
        }
    }

    #[tokio::test]
    async fn submit_accepts_boundary_priorities() {
        let lc = fixture(3);
        assert!(lc.submit("email", 1, serde_json::json!({})).await.is_ok());
        assert!(lc.submit("email", 10, serde_json::json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn happy_path_records_one_attempt() {
        let lc = fixture(3);
        let job = lc.submit("email", 5, serde_json::json!({})).await.unwrap();
        let claimed = lc.broker().claim("email", 1).unwrap();
        assert_eq!(claimed[0].id, job.id);

        let active = lc.mark_active(job.id).await.unwrap();
        assert_eq!(active.status, JobStatus::Active);
        assert_eq!(active.attempts, 1);
        assert!(active.started_at.is_some());

        let done = lc
            .mark_completed(&active, serde_json::json!({"ok": true}), 12)
            .await
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress, 100);
        assert!(done.result.is_some());

        let results = lc.store().results_for(job.id).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
    }

    #[tokio::test]
    async fn failure_with_retries_goes_delayed() {
        let lc = fixture(3);
        let job = lc.submit("email", 5, serde_json::json!({})).await.unwrap();
        lc.broker().claim("email", 1).unwrap();
        let active = lc.mark_active(job.id).await.unwrap();

        let decision = lc
            .mark_failed(&active, &HandlerError::new("boom"), 5)
            .await
            .unwrap();
        assert!(matches!(decision, RetryDecision::Retry { .. }));

        let stored = lc.get(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Delayed);
        assert!(stored.scheduled_at.is_some());
        assert_eq!(stored.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn zero_retries_dies_on_first_failure() {
        let lc = fixture(0);
        let job = lc.submit("email", 5, serde_json::json!({})).await.unwrap();
        lc.broker().claim("email", 1).unwrap();
        let active = lc.mark_active(job.id).await.unwrap();

        let decision = lc
            .mark_failed(&active, &HandlerError::new("boom"), 5)
            .await
            .unwrap();
        assert_eq!(decision, RetryDecision::Dead);

        let stored = lc.get(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Dead);
        let results = lc.store().results_for(job.id).await.unwrap();
        assert_eq!(results.len(), stored.attempts as usize);
    }

    #[tokio::test]
    async fn non_retriable_failure_parks_and_retry_failed_revives() {
        let lc = fixture(3);
        let job = lc.submit("email", 5, serde_json::json!({})).await.unwrap();
        lc.broker().claim("email", 1).unwrap();
        let active = lc.mark_active(job.id).await.unwrap();

        let decision = lc
            .mark_failed(&active, &HandlerError::permanent("bad payload"), 5)
            .await
            .unwrap();
        assert_eq!(decision, RetryDecision::Park);
        assert_eq!(lc.get(job.id).await.unwrap().status, JobStatus::Failed);

        let moved = lc.retry_failed(Some("email")).await.unwrap();
        assert_eq!(moved, 1);
        assert_eq!(lc.get(job.id).await.unwrap().status, JobStatus::Waiting);

        // idempotent: nothing left to move
        assert_eq!(lc.retry_failed(Some("email")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn recover_leaves_fresh_active_alone() {
        let lc = fixture(3);
        let job = lc.submit("email", 5, serde_json::json!({})).await.unwrap();
        lc.broker().claim("email", 1).unwrap();
        lc.mark_active(job.id).await.unwrap();

        let report = lc.recover().await.unwrap();
        assert_eq!(report.active_left, 1);
        assert_eq!(lc.get(job.id).await.unwrap().status, JobStatus::Active);
    }

    #[tokio::test]
    async fn recover_requeues_stale_active() {
        // Simulate a crashed instance: the durable row says active, the
        // (fresh) broker knows nothing about the job.
        let lc = fixture(3).with_tuning(DEFAULT_BACKOFF_CEILING_MS, 0);
        let job = crate::kernel::jobs::Job::new("email", 5, serde_json::json!({}), 3);
        lc.store().create(&job).await.unwrap();
        let patch = StatusPatch::default()
            .started_at(Utc::now() - chrono::Duration::seconds(120))
            .attempts(1)
            .progress(0);
        lc.store()
            .update_status(job.id, JobStatus::Active, patch)
            .await
            .unwrap();

        let report = lc.recover().await.unwrap();
        assert_eq!(report.requeued, 1);

        let stored = lc.get(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Delayed);
        assert_eq!(stored.attempts, 1);
        let results = lc.store().results_for(job.id).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert_eq!(lc.broker().stats("email").unwrap().delayed, 1);
    }

    #[tokio::test]
    async fn recover_exhausted_stale_active_is_dead() {
        let lc = fixture(0).with_tuning(DEFAULT_BACKOFF_CEILING_MS, 0);
        let job = crate::kernel::jobs::Job::new("email", 5, serde_json::json!({}), 0);
        lc.store().create(&job).await.unwrap();
        let patch = StatusPatch::default()
            .started_at(Utc::now() - chrono::Duration::seconds(120))
            .attempts(1)
            .progress(0);
        lc.store()
            .update_status(job.id, JobStatus::Active, patch)
            .await
            .unwrap();

        let report = lc.recover().await.unwrap();
        assert_eq!(report.dead, 1);
        assert_eq!(lc.get(job.id).await.unwrap().status, JobStatus::Dead);
    }
}
