//! Mock publishing backend for testing
//!
//! Publish payloads can inject faults:
//! - `"delayMs": n` sleeps before answering
//! - `"fail": {"message", "code"?, "retryable"?}` (or `true`) returns a failure
//! - `"panic": "msg"` panics inside the handler

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{json, Value};
use uuid::Uuid;

use super::runtime::{LogSink, PublishRunner, RunnerResult};
use crate::protocol::{HealthReport, PublishReceipt, WorkerFailure};

/// In-memory publisher that records runs instead of publishing
#[derive(Clone, Default)]
pub struct MockPublisher {
    config: Arc<RwLock<Option<Value>>>,
    runs: Arc<AtomicU64>,
    unhealthy: Arc<AtomicBool>,
    init_failure: Option<WorkerFailure>,
}

impl MockPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject `init` with the given failure
    pub fn failing_init(mut self, failure: WorkerFailure) -> Self {
        self.init_failure = Some(failure);
        self
    }

    /// Report `error` from healthchecks
    pub fn set_unhealthy(&self, unhealthy: bool) {
        self.unhealthy.store(unhealthy, Ordering::SeqCst);
    }

    /// Successful runs so far
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PublishRunner for MockPublisher {
    async fn init(&self, config: Value) -> RunnerResult<()> {
        if let Some(ref failure) = self.init_failure {
            return Err(failure.clone());
        }
        *self.config.write() = Some(config);
        Ok(())
    }

    async fn healthcheck(&self) -> RunnerResult<HealthReport> {
        let details = json!({
            "backend": "mock",
            "initialized": self.config.read().is_some(),
            "runs": self.runs(),
        });

        if self.unhealthy.load(Ordering::SeqCst) {
            Ok(HealthReport::error(details))
        } else {
            Ok(HealthReport::ok(details))
        }
    }

    async fn publish_run(&self, payload: Value, log: &LogSink) -> RunnerResult<PublishReceipt> {
        if let Some(ms) = payload.get("delayMs").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }

        if let Some(message) = payload.get("panic") {
            let message = message.as_str().unwrap_or("mock publisher fault");
            panic!("{}", message);
        }

        match payload.get("fail") {
            Some(Value::Object(forced)) => {
                let mut failure = WorkerFailure::new(
                    forced.get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("mock publish failure"),
                );
                if let Some(code) = forced.get("code").and_then(Value::as_str) {
                    failure = failure.with_code(code);
                }
                if let Some(retryable) = forced.get("retryable").and_then(Value::as_bool) {
                    failure = failure.with_retryable(retryable);
                }
                return Err(failure);
            }
            Some(Value::Bool(true)) => return Err(WorkerFailure::new("mock publish failure")),
            _ => {}
        }

        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        log.info(format!("mock publish run {}", run));

        let target = self
            .config
            .read()
            .as_ref()
            .and_then(|c| c.get("target").cloned())
            .unwrap_or(Value::Null);

        Ok(PublishReceipt {
            run_id: Uuid::new_v4().to_string(),
            published_at: Utc::now(),
            details: json!({
                "run": run,
                "target": target,
                "payload": payload,
            }),
        })
    }

    async fn shutdown(&self, _reason: Option<String>) -> RunnerResult<()> {
        *self.config.write() = None;
        Ok(())
    }
}
