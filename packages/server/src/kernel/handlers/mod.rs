//! Built-in job processors for the six default queue types.
//!
//! The business of each type (SMTP, pixel work, HTTP egress, ...) is out of
//! scope for the core; these handlers validate their payloads, report staged
//! progress, simulate the latency profile of the real work, and return a
//! structured result document. Payload keys `"fail"` and
//! `"fail_permanently"` force a retriable or non-retriable failure, which
//! demos and tests rely on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use crate::common::HandlerError;
use crate::kernel::jobs::{Envelope, HandlerContext, HandlerRegistry, JobHandler, QueueConfig};

/// Wire the default processors into the registry, one per configured type.
/// Unknown names are skipped with a warning so a custom deployment can run
/// with a subset.
pub fn register_builtin_handlers(registry: &mut HandlerRegistry, configs: &[QueueConfig]) {
    for config in configs {
        let handler: Arc<dyn JobHandler> = match config.name.as_str() {
            "email" => Arc::new(EmailHandler),
            "image" => Arc::new(ImageHandler),
            "file" => Arc::new(FileHandler),
            "export" => Arc::new(ExportHandler),
            "api" => Arc::new(ApiCallHandler),
            "cleanup" => Arc::new(CleanupHandler),
            other => {
                warn!(job_type = other, "no built-in handler; type not registered");
                continue;
            }
        };
        registry.register(config.clone(), handler);
    }
}

/// Honor the forced-failure payload flags.
fn forced_failure(payload: &Value) -> Result<(), HandlerError> {
    if payload
        .get("fail_permanently")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        return Err(HandlerError::permanent("forced permanent failure"));
    }
    if payload.get("fail").and_then(Value::as_bool).unwrap_or(false) {
        return Err(HandlerError::new("forced failure"));
    }
    Ok(())
}

/// Sleep through the simulated workload in steps, reporting progress after
/// each one. Cancellation aborts between steps.
async fn simulate_work(
    ctx: &HandlerContext,
    total: Duration,
    steps: u32,
) -> Result<(), HandlerError> {
    let step = total / steps;
    for done in 1..=steps {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return Err(HandlerError::new("cancelled before completion"));
            }
            _ = tokio::time::sleep(step) => {}
        }
        ctx.report_progress((done * 100 / steps) as i16);
    }
    Ok(())
}

fn require_str<'a>(payload: &'a Value, key: &str, job_type: &str) -> Result<&'a str, HandlerError> {
    payload.get(key).and_then(Value::as_str).ok_or_else(|| {
        HandlerError::permanent(format!("{job_type} payload requires a string '{key}'"))
    })
}

// ============================================================================
// Handlers
// ============================================================================

/// Simulated SMTP dispatch.
pub struct EmailHandler;

#[async_trait]
impl JobHandler for EmailHandler {
    async fn run(&self, envelope: &Envelope, ctx: HandlerContext) -> Result<Value, HandlerError> {
        forced_failure(&envelope.payload)?;
        let recipients = envelope
            .payload
            .get("to")
            .and_then(Value::as_array)
            .filter(|to| !to.is_empty())
            .ok_or_else(|| {
                HandlerError::permanent("email payload requires a non-empty 'to' array")
            })?;

        simulate_work(&ctx, Duration::from_millis(150), 4).await?;
        Ok(json!({
            "delivered": recipients.len(),
            "transport": "smtp-sim",
            "subject": envelope.payload.get("subject").cloned().unwrap_or(Value::Null),
        }))
    }
}

/// Simulated image transform.
pub struct ImageHandler;

#[async_trait]
impl JobHandler for ImageHandler {
    async fn run(&self, envelope: &Envelope, ctx: HandlerContext) -> Result<Value, HandlerError> {
        forced_failure(&envelope.payload)?;
        let source = require_str(&envelope.payload, "source", "image")?;
        let width = envelope.payload.get("width").and_then(Value::as_u64).unwrap_or(1280);
        let height = envelope.payload.get("height").and_then(Value::as_u64).unwrap_or(720);

        simulate_work(&ctx, Duration::from_millis(300), 5).await?;
        Ok(json!({
            "source": source,
            "width": width,
            "height": height,
            "format": "webp",
        }))
    }
}

/// Simulated file parsing.
pub struct FileHandler;

#[async_trait]
impl JobHandler for FileHandler {
    async fn run(&self, envelope: &Envelope, ctx: HandlerContext) -> Result<Value, HandlerError> {
        forced_failure(&envelope.payload)?;
        let path = require_str(&envelope.payload, "path", "file")?;

        simulate_work(&ctx, Duration::from_millis(250), 5).await?;
        Ok(json!({
            "path": path,
            "records_parsed": path.len() as u64 * 37,
        }))
    }
}

/// Simulated data export.
pub struct ExportHandler;

#[async_trait]
impl JobHandler for ExportHandler {
    async fn run(&self, envelope: &Envelope, ctx: HandlerContext) -> Result<Value, HandlerError> {
        forced_failure(&envelope.payload)?;
        let format = require_str(&envelope.payload, "format", "export")?;
        if !matches!(format, "csv" | "json") {
            return Err(HandlerError::permanent(format!(
                "unsupported export format: {format}"
            )));
        }
        let rows = envelope.payload.get("rows").and_then(Value::as_u64).unwrap_or(100);

        simulate_work(&ctx, Duration::from_millis(400), 8).await?;
        Ok(json!({
            "format": format,
            "rows_exported": rows,
        }))
    }
}

/// Simulated outbound API call.
pub struct ApiCallHandler;

#[async_trait]
impl JobHandler for ApiCallHandler {
    async fn run(&self, envelope: &Envelope, ctx: HandlerContext) -> Result<Value, HandlerError> {
        forced_failure(&envelope.payload)?;
        let url = require_str(&envelope.payload, "url", "api")?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(HandlerError::permanent(format!("invalid url: {url}")));
        }

        simulate_work(&ctx, Duration::from_millis(120), 3).await?;
        Ok(json!({
            "url": url,
            "status": 200,
            "simulated": true,
        }))
    }
}

/// Simulated cleanup sweep.
pub struct CleanupHandler;

#[async_trait]
impl JobHandler for CleanupHandler {
    async fn run(&self, envelope: &Envelope, ctx: HandlerContext) -> Result<Value, HandlerError> {
        forced_failure(&envelope.payload)?;
        let older_than_days = envelope
            .payload
            .get("older_than_days")
            .and_then(Value::as_u64)
            .unwrap_or(30);

        simulate_work(&ctx, Duration::from_millis(80), 2).await?;
        Ok(json!({
            "older_than_days": older_than_days,
            "removed": older_than_days * 3,
        }))
    }
}
