//! Shared harness for dispatcher-level integration tests.
//!
//! Runs the real broker, lifecycle coordinator, and dispatcher against the
//! in-memory store with fast timer settings.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use conveyor_core::common::HandlerError;
use conveyor_core::kernel::jobs::{
    Backoff, Broker, Dispatcher, DispatcherConfig, Envelope, HandlerContext, HandlerRegistry, Job,
    JobHandler, JobStatus, JobStore, LifecycleCoordinator, MemoryJobStore, MetricsAggregator,
    QueueConfig,
};

pub fn queue(name: &str, concurrency: usize, max_retries: u32, retry_delay_ms: u64) -> QueueConfig {
    QueueConfig {
        name: name.to_string(),
        concurrency,
        max_retries,
        retry_delay_ms,
        backoff: Backoff::Fixed,
        keep_completed: 100,
        keep_failed: 100,
        timeout_ms: None,
    }
}

/// A handler driven entirely by the job payload:
///
/// - `"progress": n` reports n before doing anything else
/// - `"sleep_ms": n` sleeps (cancellable unless `"ignore_cancel": true`)
/// - `"fail": true` / `"fail_permanently": true` force failures
///
/// Every execution is recorded for ordering assertions.
pub struct ScriptedHandler {
    executions: Arc<Mutex<Vec<Uuid>>>,
}

impl ScriptedHandler {
    pub fn new() -> (Arc<Self>, Arc<Mutex<Vec<Uuid>>>) {
        let executions = Arc::new(Mutex::new(Vec::new()));
        (
            Arc::new(Self {
                executions: executions.clone(),
            }),
            executions,
        )
    }
}

#[async_trait]
impl JobHandler for ScriptedHandler {
    async fn run(&self, envelope: &Envelope, ctx: HandlerContext) -> Result<Value, HandlerError> {
        self.executions.lock().unwrap().push(envelope.id);
        let payload = &envelope.payload;

        if let Some(pct) = payload.get("progress").and_then(Value::as_i64) {
            ctx.report_progress(pct as i16);
        }

        if let Some(ms) = payload.get("sleep_ms").and_then(Value::as_u64) {
            let ignore_cancel = payload
                .get("ignore_cancel")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if ignore_cancel {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            } else {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => {
                        return Err(HandlerError::new("cancelled before completion"));
                    }
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                }
            }
        }

        if payload
            .get("fail_permanently")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return Err(HandlerError::permanent("scripted permanent failure"));
        }
        if payload.get("fail").and_then(Value::as_bool).unwrap_or(false) {
            return Err(HandlerError::new("scripted failure"));
        }

        Ok(serde_json::json!({"ok": true}))
    }
}

pub struct Harness {
    pub lifecycle: Arc<LifecycleCoordinator>,
    pub store: Arc<MemoryJobStore>,
    pub broker: Arc<Broker>,
    pub shutdown: CancellationToken,
    pub dispatcher_handle: JoinHandle<()>,
}

impl Harness {
    /// Start a dispatcher over the given queues, one shared handler for all.
    pub fn start(configs: Vec<QueueConfig>, handler: Arc<dyn JobHandler>) -> Self {
        Self::start_with_grace(configs, handler, Duration::from_millis(200))
    }

    pub fn start_with_grace(
        configs: Vec<QueueConfig>,
        handler: Arc<dyn JobHandler>,
        shutdown_grace: Duration,
    ) -> Self {
        let mut registry = HandlerRegistry::new();
        for config in &configs {
            registry.register(config.clone(), handler.clone());
        }
        let registry = Arc::new(registry);

        let broker = Arc::new(Broker::new(configs.iter().map(|c| c.name.clone())));
        let store = Arc::new(MemoryJobStore::new());
        let store_dyn: Arc<dyn JobStore> = store.clone();
        let lifecycle = Arc::new(LifecycleCoordinator::new(
            store_dyn.clone(),
            broker.clone(),
            registry.clone(),
        ));
        let metrics = Arc::new(MetricsAggregator::new(store_dyn, broker.clone()));

        let dispatcher = Arc::new(Dispatcher::with_config(
            lifecycle.clone(),
            registry,
            metrics,
            DispatcherConfig {
                promote_interval: Duration::from_millis(20),
                maintenance_interval: Duration::from_secs(60),
                shutdown_grace,
                progress_flush_interval: Duration::from_millis(20),
                idle_poll: Duration::from_millis(20),
            },
        ));
        let shutdown = CancellationToken::new();
        let dispatcher_handle = tokio::spawn(dispatcher.run(shutdown.clone()));

        Self {
            lifecycle,
            store,
            broker,
            shutdown,
            dispatcher_handle,
        }
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.dispatcher_handle.await;
    }
}

/// Poll until the job reaches the wanted status, panicking with the last
/// observed state on timeout.
pub async fn wait_for_status(
    lifecycle: &LifecycleCoordinator,
    id: Uuid,
    status: JobStatus,
    timeout: Duration,
) -> Job {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut last: Option<Job> = None;
    while tokio::time::Instant::now() < deadline {
        if let Ok(job) = lifecycle.get(id).await {
            if job.status == status {
                return job;
            }
            last = Some(job);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "job {id} never reached {status:?}; last seen: {:?}",
        last.map(|j| (j.status, j.attempts))
    );
}

