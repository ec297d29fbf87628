//! Handler registry: job type -> handler plus queue configuration.
//!
//! Populated once at startup and read-only afterwards. Adding a job type
//! means registering its `QueueConfig` (which sizes the dispatcher pool)
//! together with its handler.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::job::{Envelope, QueueConfig, MAX_PROGRESS};
use crate::common::HandlerError;

pub type ProgressSender = mpsc::Sender<i16>;

/// Execution context handed to a handler for one attempt.
pub struct HandlerContext {
    /// Fires on shutdown, admin cancel, or per-type timeout.
    pub cancel: CancellationToken,
    progress: ProgressSender,
}

impl HandlerContext {
    pub fn new(cancel: CancellationToken, progress: ProgressSender) -> Self {
        Self { cancel, progress }
    }

    /// Report progress in `[0,100]`. Values are clamped; if the coordinator
    /// cannot keep up, intermediate values are dropped (the latest one is
    /// always persisted before the terminal transition).
    pub fn report_progress(&self, pct: i16) {
        let _ = self.progress.try_send(pct.clamp(0, MAX_PROGRESS));
    }
}

/// The contract every processor implements.
///
/// Handlers must be idempotent with respect to observable external effects
/// when executed up to `max_retries + 1` times; the core does not enforce
/// this.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(
        &self,
        envelope: &Envelope,
        ctx: HandlerContext,
    ) -> Result<serde_json::Value, HandlerError>;
}

struct Registration {
    config: QueueConfig,
    handler: Arc<dyn JobHandler>,
}

#[derive(Default)]
pub struct HandlerRegistry {
    entries: HashMap<String, Registration>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register a job type. The config's `name` is the type key.
    pub fn register(&mut self, config: QueueConfig, handler: Arc<dyn JobHandler>) {
        self.entries
            .insert(config.name.clone(), Registration { config, handler });
    }

    pub fn handler(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.entries.get(job_type).map(|r| r.handler.clone())
    }

    pub fn config(&self, job_type: &str) -> Option<&QueueConfig> {
        self.entries.get(job_type).map(|r| &r.config)
    }

    pub fn is_registered(&self, job_type: &str) -> bool {
        self.entries.contains_key(job_type)
    }

    pub fn registered_types(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn configs(&self) -> impl Iterator<Item = &QueueConfig> {
        self.entries.values().map(|r| &r.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn register_and_resolve() {
        let mut registry = HandlerRegistry::new();
        registry.register(QueueConfig::named("email"), Arc::new(NoopHandler));

        assert!(registry.is_registered("email"));
        assert!(registry.handler("email").is_some());
        assert_eq!(registry.config("email").unwrap().name, "email");
        assert!(!registry.is_registered("image"));
        assert!(registry.handler("image").is_none());
    }

    #[test]
    fn registered_types_lists_keys() {
        let mut registry = HandlerRegistry::new();
        registry.register(QueueConfig::named("email"), Arc::new(NoopHandler));
        registry.register(QueueConfig::named("cleanup"), Arc::new(NoopHandler));

        let mut types = registry.registered_types();
        types.sort_unstable();
        assert_eq!(types, vec!["cleanup", "email"]);
    }

    #[tokio::test]
    async fn progress_clamps_and_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let ctx = HandlerContext::new(CancellationToken::new(), tx);

        ctx.report_progress(250);
        // channel full: dropped, not blocked
        ctx.report_progress(50);

        assert_eq!(rx.recv().await, Some(100));
        assert!(rx.try_recv().is_err());
    }
}
