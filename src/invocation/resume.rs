//! Listener wrapper for resumed invocations.

use std::time::Duration;

use async_trait::async_trait;

use crate::context::InvocationContext;
use crate::error::FailureDescription;
use crate::listener::{ResultForwarder, TestListener};
use crate::result::{LogDataType, LogStream, Metrics, TestDescription};

/// Makes a resumed invocation look like the continuation of the first one.
///
/// The listeners already saw `invocation_started`, so the resumed one is
/// dropped, and the final `invocation_ended` includes the time the
/// interrupted attempt had already spent.
pub struct ResumeResultForwarder {
    listeners: ResultForwarder,
    previous_elapsed: Duration,
}

impl ResumeResultForwarder {
    pub fn new(listeners: ResultForwarder, previous_elapsed: Duration) -> Self {
        Self {
            listeners,
            previous_elapsed,
        }
    }
}

#[async_trait]
impl TestListener for ResumeResultForwarder {
    async fn invocation_started(&self, _context: &InvocationContext) {}

    async fn invocation_failed(&self, failure: &FailureDescription) {
        self.listeners.invocation_failed(failure).await;
    }

    async fn invocation_ended(&self, elapsed: Duration) {
        self.listeners
            .invocation_ended(self.previous_elapsed + elapsed)
            .await;
    }

    async fn test_module_started(&self, module_context: &InvocationContext) {
        self.listeners.test_module_started(module_context).await;
    }

    async fn test_module_ended(&self) {
        self.listeners.test_module_ended().await;
    }

    async fn test_run_started(&self, run_name: &str, test_count: usize) {
        self.listeners.test_run_started(run_name, test_count).await;
    }

    async fn test_started(&self, test: &TestDescription) {
        self.listeners.test_started(test).await;
    }

    async fn test_failed(&self, test: &TestDescription, trace: &str) {
        self.listeners.test_failed(test, trace).await;
    }

    async fn test_assumption_failure(&self, test: &TestDescription, trace: &str) {
        self.listeners.test_assumption_failure(test, trace).await;
    }

    async fn test_ignored(&self, test: &TestDescription) {
        self.listeners.test_ignored(test).await;
    }

    async fn test_ended(&self, test: &TestDescription, metrics: &Metrics) {
        self.listeners.test_ended(test, metrics).await;
    }

    async fn test_run_failed(&self, message: &str) {
        self.listeners.test_run_failed(message).await;
    }

    async fn test_run_ended(&self, elapsed: Duration, metrics: &Metrics) {
        self.listeners.test_run_ended(elapsed, metrics).await;
    }

    async fn test_log(&self, name: &str, data_type: LogDataType, stream: &LogStream) {
        self.listeners.test_log(name, data_type, stream).await;
    }
}
