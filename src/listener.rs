//! Result event interface and generic listeners.
//!
//! Every component that produces results (test units, modules, shards,
//! the invocation itself) reports through [`TestListener`]. A listener
//! sees a well-nested stream of events:
//!
//! ```text
//! invocation_started
//! ├── test_module_started
//! │   ├── test_run_started
//! │   │   ├── test_started / test_failed / test_ended ...
//! │   │   └── test_run_failed?
//! │   └── test_run_ended
//! │   test_module_ended
//! ├── test_log ...          (anywhere)
//! ├── invocation_failed?
//! invocation_ended
//! ```
//!
//! All methods have no-op defaults so sinks only implement what they need.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::context::InvocationContext;
use crate::error::FailureDescription;
use crate::result::{LogDataType, LogStream, Metrics, TestDescription, TestRunResult};

/// A test listener receives result events during an invocation.
#[async_trait]
pub trait TestListener: Send + Sync {
    async fn invocation_started(&self, _context: &InvocationContext) {}

    async fn invocation_failed(&self, _failure: &FailureDescription) {}

    /// Called once when the invocation is over, with its total elapsed time.
    async fn invocation_ended(&self, _elapsed: Duration) {}

    async fn test_module_started(&self, _module_context: &InvocationContext) {}

    async fn test_module_ended(&self) {}

    async fn test_run_started(&self, _run_name: &str, _test_count: usize) {}

    async fn test_started(&self, _test: &TestDescription) {}

    async fn test_failed(&self, _test: &TestDescription, _trace: &str) {}

    async fn test_assumption_failure(&self, _test: &TestDescription, _trace: &str) {}

    async fn test_ignored(&self, _test: &TestDescription) {}

    async fn test_ended(&self, _test: &TestDescription, _metrics: &Metrics) {}

    async fn test_run_failed(&self, _message: &str) {}

    async fn test_run_ended(&self, _elapsed: Duration, _metrics: &Metrics) {}

    /// Called with a captured log. May arrive between any other events.
    async fn test_log(&self, _name: &str, _data_type: LogDataType, _stream: &LogStream) {}
}

/// An owned listener event.
///
/// Used wherever events must outlive the call that produced them: shard
/// buffering, in-memory collection and replay.
#[derive(Debug, Clone)]
pub enum InvocationEvent {
    InvocationStarted(InvocationContext),
    InvocationFailed(FailureDescription),
    InvocationEnded(Duration),
    ModuleStarted(InvocationContext),
    ModuleEnded,
    RunStarted { name: String, test_count: usize },
    TestStarted(TestDescription),
    TestFailed(TestDescription, String),
    TestAssumptionFailure(TestDescription, String),
    TestIgnored(TestDescription),
    TestEnded(TestDescription, Metrics),
    RunFailed(String),
    RunEnded(Duration, Metrics),
    Log {
        name: String,
        data_type: LogDataType,
        stream: LogStream,
    },
}

impl InvocationEvent {
    /// Delivers this event to `listener`.
    pub async fn replay(&self, listener: &dyn TestListener) {
        match self {
            Self::InvocationStarted(context) => listener.invocation_started(context).await,
            Self::InvocationFailed(failure) => listener.invocation_failed(failure).await,
            Self::InvocationEnded(elapsed) => listener.invocation_ended(*elapsed).await,
            Self::ModuleStarted(context) => listener.test_module_started(context).await,
            Self::ModuleEnded => listener.test_module_ended().await,
            Self::RunStarted { name, test_count } => {
                listener.test_run_started(name, *test_count).await
            }
            Self::TestStarted(test) => listener.test_started(test).await,
            Self::TestFailed(test, trace) => listener.test_failed(test, trace).await,
            Self::TestAssumptionFailure(test, trace) => {
                listener.test_assumption_failure(test, trace).await
            }
            Self::TestIgnored(test) => listener.test_ignored(test).await,
            Self::TestEnded(test, metrics) => listener.test_ended(test, metrics).await,
            Self::RunFailed(message) => listener.test_run_failed(message).await,
            Self::RunEnded(elapsed, metrics) => listener.test_run_ended(*elapsed, metrics).await,
            Self::Log {
                name,
                data_type,
                stream,
            } => listener.test_log(name, *data_type, stream).await,
        }
    }

    /// Returns `true` for `test_log` events.
    pub fn is_log(&self) -> bool {
        matches!(self, Self::Log { .. })
    }
}

/// A listener that does nothing.
pub struct NullListener;

#[async_trait]
impl TestListener for NullListener {}

/// A listener that forwards every event to several listeners, in order.
#[derive(Clone, Default)]
pub struct ResultForwarder {
    listeners: Vec<Arc<dyn TestListener>>,
}

impl ResultForwarder {
    pub fn new(listeners: Vec<Arc<dyn TestListener>>) -> Self {
        Self { listeners }
    }

    /// Add a listener to the forwarder.
    pub fn with_listener(mut self, listener: Arc<dyn TestListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn listeners(&self) -> &[Arc<dyn TestListener>] {
        &self.listeners
    }
}

#[async_trait]
impl TestListener for ResultForwarder {
    async fn invocation_started(&self, context: &InvocationContext) {
        for listener in &self.listeners {
            listener.invocation_started(context).await;
        }
    }

    async fn invocation_failed(&self, failure: &FailureDescription) {
        for listener in &self.listeners {
            listener.invocation_failed(failure).await;
        }
    }

    async fn invocation_ended(&self, elapsed: Duration) {
        for listener in &self.listeners {
            listener.invocation_ended(elapsed).await;
        }
    }

    async fn test_module_started(&self, module_context: &InvocationContext) {
        for listener in &self.listeners {
            listener.test_module_started(module_context).await;
        }
    }

    async fn test_module_ended(&self) {
        for listener in &self.listeners {
            listener.test_module_ended().await;
        }
    }

    async fn test_run_started(&self, run_name: &str, test_count: usize) {
        for listener in &self.listeners {
            listener.test_run_started(run_name, test_count).await;
        }
    }

    async fn test_started(&self, test: &TestDescription) {
        for listener in &self.listeners {
            listener.test_started(test).await;
        }
    }

    async fn test_failed(&self, test: &TestDescription, trace: &str) {
        for listener in &self.listeners {
            listener.test_failed(test, trace).await;
        }
    }

    async fn test_assumption_failure(&self, test: &TestDescription, trace: &str) {
        for listener in &self.listeners {
            listener.test_assumption_failure(test, trace).await;
        }
    }

    async fn test_ignored(&self, test: &TestDescription) {
        for listener in &self.listeners {
            listener.test_ignored(test).await;
        }
    }

    async fn test_ended(&self, test: &TestDescription, metrics: &Metrics) {
        for listener in &self.listeners {
            listener.test_ended(test, metrics).await;
        }
    }

    async fn test_run_failed(&self, message: &str) {
        for listener in &self.listeners {
            listener.test_run_failed(message).await;
        }
    }

    async fn test_run_ended(&self, elapsed: Duration, metrics: &Metrics) {
        for listener in &self.listeners {
            listener.test_run_ended(elapsed, metrics).await;
        }
    }

    async fn test_log(&self, name: &str, data_type: LogDataType, stream: &LogStream) {
        for listener in &self.listeners {
            listener.test_log(name, data_type, stream).await;
        }
    }
}

#[derive(Default)]
struct Collected {
    events: Vec<InvocationEvent>,
    runs: Vec<TestRunResult>,
}

/// A listener that keeps every event in memory.
///
/// Events are also folded into [`TestRunResult`]s. A `test_run_started`
/// with the same name as a still-open run continues that run.
#[derive(Default)]
pub struct CollectingListener {
    state: Mutex<Collected>,
}

impl CollectingListener {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, event: InvocationEvent) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match &event {
            InvocationEvent::RunStarted { name, test_count } => {
                match state.runs.last_mut() {
                    Some(run) if run.name() == name && !run.is_complete() => {
                        run.run_started(*test_count)
                    }
                    _ => {
                        let mut run = TestRunResult::new(name.clone());
                        run.run_started(*test_count);
                        state.runs.push(run);
                    }
                }
            }
            InvocationEvent::TestStarted(test) => {
                if let Some(run) = state.runs.last_mut() {
                    run.test_started(test);
                }
            }
            InvocationEvent::TestFailed(test, trace) => {
                if let Some(run) = state.runs.last_mut() {
                    run.test_failed(test, trace);
                }
            }
            InvocationEvent::TestAssumptionFailure(test, trace) => {
                if let Some(run) = state.runs.last_mut() {
                    run.test_assumption_failure(test, trace);
                }
            }
            InvocationEvent::TestIgnored(test) => {
                if let Some(run) = state.runs.last_mut() {
                    run.test_ignored(test);
                }
            }
            InvocationEvent::TestEnded(test, metrics) => {
                if let Some(run) = state.runs.last_mut() {
                    run.test_ended(test, metrics);
                }
            }
            InvocationEvent::RunFailed(message) => {
                if let Some(run) = state.runs.last_mut() {
                    run.run_failed(message.clone());
                }
            }
            InvocationEvent::RunEnded(elapsed, metrics) => {
                if let Some(run) = state.runs.last_mut() {
                    run.run_ended(*elapsed, metrics);
                }
            }
            _ => {}
        }
        state.events.push(event);
    }

    /// Every event received so far, in order.
    pub fn events(&self) -> Vec<InvocationEvent> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .events
            .clone()
    }

    /// Test runs folded from the events received so far.
    pub fn runs(&self) -> Vec<TestRunResult> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .runs
            .clone()
    }

    pub fn invocation_started_count(&self) -> usize {
        self.count(|e| matches!(e, InvocationEvent::InvocationStarted(_)))
    }

    /// Elapsed times of every `invocation_ended` received.
    pub fn ended_invocations(&self) -> Vec<Duration> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                InvocationEvent::InvocationEnded(elapsed) => Some(elapsed),
                _ => None,
            })
            .collect()
    }

    pub fn invocation_failures(&self) -> Vec<FailureDescription> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                InvocationEvent::InvocationFailed(failure) => Some(failure),
                _ => None,
            })
            .collect()
    }

    /// Names of every `test_log` received, in order.
    pub fn log_names(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                InvocationEvent::Log { name, .. } => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&InvocationEvent) -> bool) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .events
            .iter()
            .filter(|e| predicate(e))
            .count()
    }
}

#[async_trait]
impl TestListener for CollectingListener {
    async fn invocation_started(&self, context: &InvocationContext) {
        self.record(InvocationEvent::InvocationStarted(context.clone()));
    }

    async fn invocation_failed(&self, failure: &FailureDescription) {
        self.record(InvocationEvent::InvocationFailed(failure.clone()));
    }

    async fn invocation_ended(&self, elapsed: Duration) {
        self.record(InvocationEvent::InvocationEnded(elapsed));
    }

    async fn test_module_started(&self, module_context: &InvocationContext) {
        self.record(InvocationEvent::ModuleStarted(module_context.clone()));
    }

    async fn test_module_ended(&self) {
        self.record(InvocationEvent::ModuleEnded);
    }

    async fn test_run_started(&self, run_name: &str, test_count: usize) {
        self.record(InvocationEvent::RunStarted {
            name: run_name.to_string(),
            test_count,
        });
    }

    async fn test_started(&self, test: &TestDescription) {
        self.record(InvocationEvent::TestStarted(test.clone()));
    }

    async fn test_failed(&self, test: &TestDescription, trace: &str) {
        self.record(InvocationEvent::TestFailed(test.clone(), trace.to_string()));
    }

    async fn test_assumption_failure(&self, test: &TestDescription, trace: &str) {
        self.record(InvocationEvent::TestAssumptionFailure(
            test.clone(),
            trace.to_string(),
        ));
    }

    async fn test_ignored(&self, test: &TestDescription) {
        self.record(InvocationEvent::TestIgnored(test.clone()));
    }

    async fn test_ended(&self, test: &TestDescription, metrics: &Metrics) {
        self.record(InvocationEvent::TestEnded(test.clone(), metrics.clone()));
    }

    async fn test_run_failed(&self, message: &str) {
        self.record(InvocationEvent::RunFailed(message.to_string()));
    }

    async fn test_run_ended(&self, elapsed: Duration, metrics: &Metrics) {
        self.record(InvocationEvent::RunEnded(elapsed, metrics.clone()));
    }

    async fn test_log(&self, name: &str, data_type: LogDataType, stream: &LogStream) {
        self.record(InvocationEvent::Log {
            name: name.to_string(),
            data_type,
            stream: stream.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::TestStatus;

    #[tokio::test]
    async fn test_forwarder_fans_out_in_order() {
        let a = Arc::new(CollectingListener::new());
        let b = Arc::new(CollectingListener::new());
        let forwarder = ResultForwarder::new(vec![a.clone()]).with_listener(b.clone());

        forwarder.test_run_started("run", 1).await;
        forwarder.test_run_ended(Duration::ZERO, &Metrics::new()).await;

        assert_eq!(a.events().len(), 2);
        assert_eq!(b.events().len(), 2);
        assert_eq!(forwarder.listeners().len(), 2);
    }

    #[tokio::test]
    async fn test_collector_folds_runs() {
        let collector = CollectingListener::new();
        let test = TestDescription::new("Unit", "case");

        collector.test_run_started("unit", 1).await;
        collector.test_started(&test).await;
        collector.test_failed(&test, "boom").await;
        collector.test_ended(&test, &Metrics::new()).await;
        collector.test_run_failed("crashed").await;
        collector.test_run_ended(Duration::from_millis(5), &Metrics::new()).await;

        let runs = collector.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].num_tests_in_state(TestStatus::Failure), 1);
        assert_eq!(runs[0].run_failures(), &["crashed".to_string()]);
        assert!(runs[0].is_complete());
    }

    #[tokio::test]
    async fn test_collector_continues_open_run() {
        let collector = CollectingListener::new();
        collector.test_run_started("unit", 2).await;
        collector.test_run_started("unit", 3).await;
        assert_eq!(collector.runs().len(), 1);
        assert_eq!(collector.runs()[0].expected_count(), 5);

        collector.test_run_ended(Duration::ZERO, &Metrics::new()).await;
        collector.test_run_started("unit", 1).await;
        assert_eq!(collector.runs().len(), 2);
    }

    #[tokio::test]
    async fn test_replay_reproduces_events() {
        let source = CollectingListener::new();
        source.invocation_started(&InvocationContext::new("cfg")).await;
        source
            .test_log("host_log", LogDataType::HostLog, &LogStream::from_bytes("x"))
            .await;
        source.invocation_ended(Duration::from_secs(1)).await;

        let target = CollectingListener::new();
        for event in source.events() {
            event.replay(&target).await;
        }
        assert_eq!(target.invocation_started_count(), 1);
        assert_eq!(target.log_names(), vec!["host_log"]);
        assert_eq!(target.ended_invocations(), vec![Duration::from_secs(1)]);
    }
}
