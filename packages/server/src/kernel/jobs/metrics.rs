//! Pull-based system metrics.
//!
//! Snapshots compose the store's aggregates with broker stats and runtime
//! data. No background timer: callers ask when they want numbers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use super::broker::{Broker, QueueStats};
use super::store::JobStore;
use crate::common::CoreResult;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetrics {
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub failed_tasks: i64,
    pub pending_tasks: i64,
    pub avg_processing_seconds: f64,
    pub success_rate_pct: f64,
    pub throughput_per_hour: f64,
    pub uptime_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_rss_bytes: Option<u64>,
    pub queues: HashMap<String, QueueStats>,
}

pub struct MetricsAggregator {
    store: Arc<dyn JobStore>,
    broker: Arc<Broker>,
    started_at: Instant,
}

impl MetricsAggregator {
    pub fn new(store: Arc<dyn JobStore>, broker: Arc<Broker>) -> Self {
        Self {
            store,
            broker,
            started_at: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub async fn snapshot(&self) -> CoreResult<SystemMetrics> {
        let store_metrics = self.store.metrics_snapshot().await?;
        let uptime = self.started_at.elapsed();
        let uptime_hours = (uptime.as_secs_f64() / 3_600.0).max(f64::EPSILON);

        Ok(SystemMetrics {
            total_tasks: store_metrics.total,
            completed_tasks: store_metrics.completed,
            failed_tasks: store_metrics.failed,
            pending_tasks: store_metrics.pending,
            avg_processing_seconds: store_metrics.avg_processing_seconds,
            success_rate_pct: store_metrics.success_rate_pct,
            throughput_per_hour: store_metrics.completed as f64 / uptime_hours,
            uptime_seconds: uptime.as_secs(),
            memory_rss_bytes: resident_memory_bytes(),
            queues: self.broker.stats_all(),
        })
    }

    /// Persist a few headline samples into `system_metrics`. Called from the
    /// dispatcher's maintenance tick.
    pub async fn persist_samples(&self) -> CoreResult<()> {
        let store_metrics = self.store.metrics_snapshot().await?;
        self.store
            .record_metric("completed_total", store_metrics.completed as f64, None)
            .await?;
        self.store
            .record_metric("failed_total", store_metrics.failed as f64, None)
            .await?;
        self.store
            .record_metric(
                "success_rate_pct",
                store_metrics.success_rate_pct,
                None,
            )
            .await?;
        for (queue, stats) in self.broker.stats_all() {
            self.store
                .record_metric(
                    "queue_depth",
                    stats.waiting as f64,
                    Some(serde_json::json!({ "queue": queue })),
                )
                .await?;
        }
        Ok(())
    }
}

/// Resident set size from `/proc/self/status` (VmRSS), where available.
pub fn resident_memory_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::testing::MemoryJobStore;

    #[tokio::test]
    async fn snapshot_on_empty_system_is_all_zero() {
        let store = Arc::new(MemoryJobStore::new());
        let broker = Arc::new(Broker::new(["email".to_string()]));
        let aggregator = MetricsAggregator::new(store, broker);

        let metrics = aggregator.snapshot().await.unwrap();
        assert_eq!(metrics.total_tasks, 0);
        assert_eq!(metrics.completed_tasks, 0);
        assert_eq!(metrics.success_rate_pct, 0.0);
        assert_eq!(metrics.throughput_per_hour, 0.0);
        assert!(metrics.queues.contains_key("email"));
    }

    #[tokio::test]
    async fn persist_samples_records_headline_metrics() {
        let store = Arc::new(MemoryJobStore::new());
        let broker = Arc::new(Broker::new(["email".to_string()]));
        let aggregator = MetricsAggregator::new(store.clone(), broker);

        aggregator.persist_samples().await.unwrap();
        let names: Vec<String> = store
            .metric_samples()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert!(names.contains(&"completed_total".to_string()));
        assert!(names.contains(&"queue_depth".to_string()));
    }

    #[test]
    fn serialized_metrics_use_camel_case() {
        let metrics = SystemMetrics {
            total_tasks: 1,
            completed_tasks: 1,
            failed_tasks: 0,
            pending_tasks: 0,
            avg_processing_seconds: 0.5,
            success_rate_pct: 100.0,
            throughput_per_hour: 10.0,
            uptime_seconds: 60,
            memory_rss_bytes: None,
            queues: HashMap::new(),
        };
        let json = serde_json::to_string(&metrics).unwrap();
        assert!(json.contains("completedTasks"));
        assert!(json.contains("throughputPerHour"));
        assert!(!json.contains("memoryRssBytes"));
    }
}
