//! Scheduler/dispatcher: one worker pool per queue type.
//!
//! Each queue runs `concurrency` workers plus a promoter that moves due
//! delayed jobs into the ready set every 200 ms. Workers block on the
//! broker's notify (with a short fallback sleep), claim one envelope at a
//! time, and never buffer beyond the claimed envelope.
//!
//! ```text
//! worker loop
//!     ├─► Broker.claim(type, 1)
//!     ├─► LifecycleCoordinator.mark_active
//!     ├─► handler.run(envelope, ctx)      (cancellable, optional timeout)
//!     └─► mark_completed / mark_failed
//! ```
//!
//! Shutdown: the cancellation token stops new claims, child tokens cancel
//! in-flight handlers, and after the grace period stragglers are abandoned
//! with their durable record still `active` - boot recovery picks them up.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::job::{Envelope, QueueConfig};
use super::lifecycle::LifecycleCoordinator;
use super::metrics::MetricsAggregator;
use super::registry::{HandlerContext, HandlerRegistry};
use super::store::JobStore;
use crate::common::{CoreError, HandlerError};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Promoter tick per queue.
    pub promote_interval: Duration,
    /// Retention sweep and metrics sampling tick.
    pub maintenance_interval: Duration,
    /// How long shutdown waits for in-flight handlers.
    pub shutdown_grace: Duration,
    /// Progress writes are coalesced to at most one per this interval.
    pub progress_flush_interval: Duration,
    /// Fallback poll when the broker notify is missed.
    pub idle_poll: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            promote_interval: Duration::from_millis(200),
            maintenance_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(30),
            progress_flush_interval: Duration::from_millis(500),
            idle_poll: Duration::from_millis(200),
        }
    }
}

pub struct Dispatcher {
    lifecycle: Arc<LifecycleCoordinator>,
    registry: Arc<HandlerRegistry>,
    metrics: Arc<MetricsAggregator>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        lifecycle: Arc<LifecycleCoordinator>,
        registry: Arc<HandlerRegistry>,
        metrics: Arc<MetricsAggregator>,
    ) -> Self {
        Self {
            lifecycle,
            registry,
            metrics,
            config: DispatcherConfig::default(),
        }
    }

    pub fn with_config(
        lifecycle: Arc<LifecycleCoordinator>,
        registry: Arc<HandlerRegistry>,
        metrics: Arc<MetricsAggregator>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            lifecycle,
            registry,
            metrics,
            config,
        }
    }

    /// Run all queue pools until the token cancels, then drain within the
    /// grace period.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut tasks = JoinSet::new();

        for queue in self.registry.configs() {
            let queue = queue.clone();
            info!(
                queue = %queue.name,
                concurrency = queue.concurrency,
                max_retries = queue.max_retries,
                "starting queue pool"
            );

            tasks.spawn(Self::promoter_loop(
                self.clone(),
                queue.name.clone(),
                shutdown.clone(),
            ));
            tasks.spawn(Self::maintenance_loop(
                self.clone(),
                queue.clone(),
                shutdown.clone(),
            ));
            for worker_no in 0..queue.concurrency {
                tasks.spawn(Self::worker_loop(
                    self.clone(),
                    queue.clone(),
                    worker_no,
                    shutdown.clone(),
                ));
            }
        }
        tasks.spawn(Self::metrics_loop(self.clone(), shutdown.clone()));

        shutdown.cancelled().await;
        info!("dispatcher shutting down, draining workers");

        let deadline = Instant::now() + self.config.shutdown_grace;
        while !tasks.is_empty() {
            let joined = tokio::time::timeout_at(deadline, tasks.join_next()).await;
            match joined {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        remaining = tasks.len(),
                        "shutdown grace elapsed; abandoning in-flight handlers"
                    );
                    tasks.abort_all();
                    break;
                }
            }
        }
        info!("dispatcher stopped");
    }

    async fn worker_loop(
        self: Arc<Self>,
        queue: QueueConfig,
        worker_no: usize,
        shutdown: CancellationToken,
    ) {
        debug!(queue = %queue.name, worker_no, "worker started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let claimed = match self.lifecycle.broker().claim(&queue.name, 1) {
                Ok(claimed) => claimed,
                Err(e) => {
                    error!(queue = %queue.name, error = %e, "claim failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let Some(envelope) = claimed.into_iter().next() else {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.lifecycle.broker().ready_signal(&queue.name) => {}
                    _ = tokio::time::sleep(self.config.idle_poll) => {}
                }
                continue;
            };

            self.process(envelope, &queue, &shutdown).await;
        }
        debug!(queue = %queue.name, worker_no, "worker stopped");
    }

    /// Execute one claimed envelope through a full attempt.
    async fn process(&self, envelope: Envelope, queue: &QueueConfig, shutdown: &CancellationToken) {
        let job = match self.lifecycle.mark_active(envelope.id).await {
            Ok(job) => job,
            Err(CoreError::TransientInfra(msg)) => {
                // The store never acknowledged the claim; put the envelope
                // back on a short delay and let a later claim retry it.
                warn!(job_id = %envelope.id, error = %msg, "store unreachable, re-queueing claim");
                let _ = self
                    .lifecycle
                    .broker()
                    .fail(&queue.name, envelope.id, Some(1_000));
                return;
            }
            Err(e) => {
                // Durable state refused the claim (terminal, mid-transition,
                // or deleted); the store is authoritative, drop the envelope.
                warn!(job_id = %envelope.id, error = %e, "claim rejected by store");
                let _ = self.lifecycle.broker().ack(&queue.name, envelope.id);
                return;
            }
        };

        let Some(handler) = self.registry.handler(&envelope.job_type) else {
            let err = HandlerError::permanent(format!(
                "no handler registered for type {}",
                envelope.job_type
            ));
            if let Err(e) = self.lifecycle.mark_failed(&job, &err, 0).await {
                error!(job_id = %job.id, error = %e, "failed to record missing-handler failure");
            }
            return;
        };

        let (progress_tx, progress_rx) = mpsc::channel(16);
        let pump = tokio::spawn(progress_pump(
            self.lifecycle.store().clone(),
            job.id,
            progress_rx,
            self.config.progress_flush_interval,
        ));

        let job_cancel = shutdown.child_token();
        let ctx = HandlerContext::new(job_cancel.clone(), progress_tx);

        let started = Instant::now();
        let outcome = match queue.timeout_ms {
            Some(timeout_ms) => {
                match tokio::time::timeout(
                    Duration::from_millis(timeout_ms),
                    handler.run(&envelope, ctx),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        job_cancel.cancel();
                        Err(HandlerError::new(format!(
                            "handler timed out after {timeout_ms}ms"
                        )))
                    }
                }
            }
            None => handler.run(&envelope, ctx).await,
        };
        let duration_ms = started.elapsed().as_millis() as i64;

        // The context (and with it the progress sender) is gone by now; wait
        // for the pump so the last progress value is durable before the
        // terminal transition.
        let _ = pump.await;

        match outcome {
            Ok(result) => {
                if let Err(e) = self.lifecycle.mark_completed(&job, result, duration_ms).await {
                    error!(job_id = %job.id, error = %e, "failed to record completion");
                }
            }
            Err(handler_error) => {
                if let Err(e) = self
                    .lifecycle
                    .mark_failed(&job, &handler_error, duration_ms)
                    .await
                {
                    error!(job_id = %job.id, error = %e, "failed to record failure");
                }
            }
        }
    }

    async fn promoter_loop(self: Arc<Self>, queue_name: String, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(self.config.promote_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    match self.lifecycle.promote_due(&queue_name).await {
                        Ok(0) => {}
                        Ok(promoted) => debug!(queue = %queue_name, promoted, "promoted due jobs"),
                        Err(e) => warn!(queue = %queue_name, error = %e, "promote sweep failed"),
                    }
                }
            }
        }
    }

    /// Low-frequency housekeeping: trim completed/failed rows beyond the
    /// queue's keep counts.
    async fn maintenance_loop(self: Arc<Self>, queue: QueueConfig, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(self.config.maintenance_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // skip the immediate first tick so boot stays quiet
        tick.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    match self
                        .lifecycle
                        .store()
                        .trim_finished(&queue.name, queue.keep_completed, queue.keep_failed)
                        .await
                    {
                        Ok(0) => {}
                        Ok(deleted) => info!(queue = %queue.name, deleted, "retention sweep"),
                        Err(e) => warn!(queue = %queue.name, error = %e, "retention sweep failed"),
                    }
                }
            }
        }
    }

    /// Periodic metric samples into the durable `system_metrics` table.
    async fn metrics_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(self.config.maintenance_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = self.metrics.persist_samples().await {
                        debug!(error = %e, "metric sampling failed");
                    }
                }
            }
        }
    }
}

/// Drain a handler's progress channel, writing at most one durable value per
/// flush interval and always flushing the final value before returning.
/// Progress is monotonic within an attempt: decreases are dropped.
async fn progress_pump(
    store: Arc<dyn JobStore>,
    job_id: Uuid,
    mut rx: mpsc::Receiver<i16>,
    flush_interval: Duration,
) {
    let mut latest: Option<i16> = None;
    let mut written: Option<i16> = None;
    let mut tick = tokio::time::interval(flush_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(pct) => {
                    if latest.map_or(true, |l| pct > l) {
                        latest = Some(pct);
                    }
                }
                None => break,
            },
            _ = tick.tick() => {
                if latest != written {
                    if let Some(pct) = latest {
                        let _ = store.set_progress(job_id, pct).await;
                        written = latest;
                    }
                }
            }
        }
    }

    if latest != written {
        if let Some(pct) = latest {
            let _ = store.set_progress(job_id, pct).await;
        }
    }
}
