//! Job infrastructure for background task execution.
//!
//! - [`Job`] - durable job model and status machine
//! - [`JobStore`] - storage trait with the PostgreSQL implementation
//! - [`Broker`] - in-memory ready/active/delayed/failed sets per queue
//! - [`LifecycleCoordinator`] - owns every status mutation
//! - [`Dispatcher`] - per-queue worker pools
//! - [`HandlerRegistry`] - job type -> handler mapping
//!
//! # Architecture
//!
//! ```text
//! Admission (HTTP)
//!     └─► LifecycleCoordinator.submit()
//!             ├─► JobStore.create()          (durable record first)
//!             └─► Broker.enqueue()           (ready or delayed set)
//!
//! Dispatcher worker (one pool per queue type)
//!     ├─► Broker.claim()
//!     ├─► LifecycleCoordinator.mark_active()
//!     ├─► HandlerRegistry -> handler.run(envelope, ctx)
//!     └─► mark_completed / mark_failed  (retry engine decides the branch)
//! ```
//!
//! The durable store is authoritative; the broker is a cache of schedulable
//! state and can be rebuilt from the store on boot.

pub mod broker;
pub mod dispatcher;
mod job;
pub mod lifecycle;
pub mod metrics;
pub mod registry;
pub mod retry;
mod store;
pub mod testing;

pub use broker::{Broker, QueueStats};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use job::{
    priority_in_range, AttemptRecord, Backoff, Envelope, Job, JobStatus, QueueConfig,
    DEFAULT_PRIORITY, MAX_PROGRESS,
};
pub use lifecycle::LifecycleCoordinator;
pub use metrics::{MetricsAggregator, SystemMetrics};
pub use registry::{HandlerContext, HandlerRegistry, JobHandler, ProgressSender};
pub use retry::{RetryDecision, RetryPolicy};
pub use store::{JobStore, PostgresJobStore, StatusPatch, StoreMetrics};
pub use testing::MemoryJobStore;
