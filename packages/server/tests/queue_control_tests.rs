//! Priorities, pause/resume, retry-failed, shutdown and recovery.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{queue, wait_for_status, Harness, ScriptedHandler};
use conveyor_core::kernel::jobs::{
    Broker, HandlerRegistry, JobStatus, JobStore, LifecycleCoordinator,
};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn lower_priority_value_starts_first() {
    let (handler, executions) = ScriptedHandler::new();
    let harness = Harness::start(vec![queue("image", 1, 0, 20)], handler);

    // enqueue while paused so ordering is decided purely by the ready set
    harness.lifecycle.pause("image").unwrap();

    let mut normal_ids = Vec::new();
    for _ in 0..3 {
        let job = harness
            .lifecycle
            .submit("image", 5, json!({"sleep_ms": 10}))
            .await
            .unwrap();
        normal_ids.push(job.id);
    }
    let urgent = harness
        .lifecycle
        .submit("image", 1, json!({"sleep_ms": 10}))
        .await
        .unwrap();

    harness.lifecycle.resume("image").unwrap();

    wait_for_status(&harness.lifecycle, normal_ids[2], JobStatus::Completed, WAIT).await;
    let order = executions.lock().unwrap().clone();
    assert_eq!(order[0], urgent.id, "urgent job must start first");
    assert_eq!(&order[1..], &normal_ids[..], "ties drain in FIFO order");

    harness.stop().await;
}

#[tokio::test]
async fn paused_queue_holds_jobs_until_resume() {
    let (handler, executions) = ScriptedHandler::new();
    let harness = Harness::start(vec![queue("cleanup", 2, 0, 20)], handler);

    harness.lifecycle.pause("cleanup").unwrap();
    // pausing twice is the same as pausing once
    harness.lifecycle.pause("cleanup").unwrap();

    let mut ids = Vec::new();
    for _ in 0..5 {
        let job = harness
            .lifecycle
            .submit("cleanup", 5, json!({}))
            .await
            .unwrap();
        ids.push(job.id);
    }

    // give the workers a chance to (wrongly) pick something up
    tokio::time::sleep(Duration::from_millis(150)).await;
    let stats = harness.broker.stats("cleanup").unwrap();
    assert_eq!(stats.waiting, 5);
    assert_eq!(stats.active, 0);
    assert!(stats.paused);
    assert!(executions.lock().unwrap().is_empty());

    harness.lifecycle.resume("cleanup").unwrap();
    for id in ids {
        wait_for_status(&harness.lifecycle, id, JobStatus::Completed, WAIT).await;
    }
    let stats = harness.broker.stats("cleanup").unwrap();
    assert_eq!(stats.waiting, 0);
    assert!(!stats.paused);

    harness.stop().await;
}

#[tokio::test]
async fn retry_failed_revives_parked_jobs_but_not_dead_ones() {
    let (handler, _executions) = ScriptedHandler::new();
    let harness = Harness::start(vec![queue("api", 2, 3, 20)], handler);

    // two jobs park in `failed` via non-retriable errors
    let parked_a = harness
        .lifecycle
        .submit("api", 5, json!({"fail_permanently": true}))
        .await
        .unwrap();
    let parked_b = harness
        .lifecycle
        .submit("api", 5, json!({"fail_permanently": true}))
        .await
        .unwrap();
    wait_for_status(&harness.lifecycle, parked_a.id, JobStatus::Failed, WAIT).await;
    wait_for_status(&harness.lifecycle, parked_b.id, JobStatus::Failed, WAIT).await;

    // pause so revived jobs stay observable in `waiting`
    harness.lifecycle.pause("api").unwrap();

    let retried = harness.lifecycle.retry_failed(None).await.unwrap();
    assert_eq!(retried, 2);
    assert_eq!(
        harness.lifecycle.get(parked_a.id).await.unwrap().status,
        JobStatus::Waiting
    );

    // without new failures a second sweep is a no-op
    assert_eq!(harness.lifecycle.retry_failed(None).await.unwrap(), 0);

    harness.stop().await;
}

#[tokio::test]
async fn dead_jobs_survive_retry_failed_untouched() {
    let (handler, _executions) = ScriptedHandler::new();
    let harness = Harness::start(vec![queue("api", 1, 0, 20)], handler);

    let dead = harness
        .lifecycle
        .submit("api", 5, json!({"fail": true}))
        .await
        .unwrap();
    wait_for_status(&harness.lifecycle, dead.id, JobStatus::Dead, WAIT).await;

    assert_eq!(harness.lifecycle.retry_failed(None).await.unwrap(), 0);
    assert_eq!(
        harness.lifecycle.get(dead.id).await.unwrap().status,
        JobStatus::Dead
    );

    harness.stop().await;
}

#[tokio::test]
async fn shutdown_leaves_stragglers_active_and_recovery_requeues_them() {
    let (handler, _executions) = ScriptedHandler::new();
    let harness = Harness::start_with_grace(
        vec![queue("export", 1, 3, 20)],
        handler,
        Duration::from_millis(100),
    );

    // sleeps far past the grace period and ignores cancellation
    let job = harness
        .lifecycle
        .submit("export", 5, json!({"sleep_ms": 60_000, "ignore_cancel": true}))
        .await
        .unwrap();
    wait_for_status(&harness.lifecycle, job.id, JobStatus::Active, WAIT).await;

    let store = harness.store.clone();
    harness.stop().await;

    // the abandoned attempt is still durably active
    let stranded = store.get(job.id).await.unwrap();
    assert_eq!(stranded.status, JobStatus::Active);
    assert_eq!(stranded.attempts, 1);

    // next boot: fresh broker, zero stale threshold, same store
    let mut registry = HandlerRegistry::new();
    registry.register(queue("export", 1, 3, 20), Arc::new(NoRun));
    let registry = Arc::new(registry);
    let broker = Arc::new(Broker::new(["export".to_string()]));
    let store_dyn: Arc<dyn JobStore> = store;
    let lifecycle = LifecycleCoordinator::new(store_dyn, broker.clone(), registry)
        .with_tuning(600_000, 0);

    let report = lifecycle.recover().await.unwrap();
    assert_eq!(report.requeued, 1);

    let recovered = lifecycle.get(job.id).await.unwrap();
    assert_eq!(recovered.status, JobStatus::Delayed);
    assert_eq!(broker.stats("export").unwrap().delayed, 1);
    // the interrupted attempt left a history row
    let results = lifecycle.store().results_for(job.id).await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(!results[0].success);
}

struct NoRun;

#[async_trait::async_trait]
impl conveyor_core::kernel::jobs::JobHandler for NoRun {
    async fn run(
        &self,
        _envelope: &conveyor_core::kernel::jobs::Envelope,
        _ctx: conveyor_core::kernel::jobs::HandlerContext,
    ) -> Result<serde_json::Value, conveyor_core::common::HandlerError> {
        Ok(serde_json::json!({}))
    }
}

#[tokio::test]
async fn concurrency_limit_bounds_running_handlers() {
    let (handler, _executions) = ScriptedHandler::new();
    let harness = Harness::start(vec![queue("file", 2, 0, 20)], handler);

    let mut ids = Vec::new();
    for _ in 0..6 {
        let job = harness
            .lifecycle
            .submit("file", 5, json!({"sleep_ms": 100}))
            .await
            .unwrap();
        ids.push(job.id);
    }

    // sample the active set while the backlog drains
    let mut max_active = 0;
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        let stats = harness.broker.stats("file").unwrap();
        max_active = max_active.max(stats.active);
        if stats.waiting == 0 && stats.active == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(max_active <= 2, "active never exceeds concurrency, saw {max_active}");

    for id in ids {
        wait_for_status(&harness.lifecycle, id, JobStatus::Completed, WAIT).await;
    }
    harness.stop().await;
}
