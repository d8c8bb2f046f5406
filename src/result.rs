//! Test result data model.
//!
//! Test units report their progress as a stream of listener events (see
//! [`crate::listener`]). This module holds the owned data those events are
//! folded into:
//!
//! - [`TestDescription`]: identity of a single test case
//! - [`TestResult`]: outcome of one test case
//! - [`TestRunResult`]: one logical test run (a named group of test cases)
//! - [`LogStream`]: captured log payload passed through `test_log`

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Metrics attached to a test case or a test run.
///
/// Ordered so reports render deterministically.
pub type Metrics = BTreeMap<String, String>;

/// Identity of a single test case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TestDescription {
    /// Grouping name, typically the test unit or class.
    pub class_name: String,

    /// Name of the test case within its class.
    pub test_name: String,
}

impl TestDescription {
    pub fn new(class_name: impl Into<String>, test_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            test_name: test_name.into(),
        }
    }
}

impl std::fmt::Display for TestDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.class_name, self.test_name)
    }
}

/// Outcome of a single test case.
///
/// | Status | Description | Fails the run? |
/// |--------|-------------|----------------|
/// | Passed | Test ended without a failure | No |
/// | Failure | Test reported a failure | Yes |
/// | AssumptionFailure | A precondition of the test was not met | No |
/// | Ignored | Test was intentionally not run | No |
/// | Incomplete | Test started but never ended | Yes |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failure,
    AssumptionFailure,
    Ignored,
    Incomplete,
}

impl TestStatus {
    /// Returns `true` if this status does not fail the run.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            TestStatus::Passed | TestStatus::AssumptionFailure | TestStatus::Ignored
        )
    }
}

/// The result of executing a single test case.
#[derive(Debug, Clone)]
pub struct TestResult {
    pub status: TestStatus,

    /// Failure trace for failed or assumption-failed tests.
    pub stack_trace: Option<String>,

    pub metrics: Metrics,

    /// Wall-clock time between `test_started` and `test_ended`.
    pub elapsed: Duration,

    started: Option<Instant>,
}

impl TestResult {
    fn started() -> Self {
        Self {
            status: TestStatus::Incomplete,
            stack_trace: None,
            metrics: Metrics::new(),
            elapsed: Duration::ZERO,
            started: Some(Instant::now()),
        }
    }
}

/// One logical test run: a named, ordered collection of test results.
///
/// A `TestRunResult` is built incrementally from listener events. Multiple
/// `test_run_started` calls on the same run accumulate their expected
/// counts, which is how a test unit that reports several internal runs is
/// folded into one.
#[derive(Debug, Clone)]
pub struct TestRunResult {
    name: String,
    expected_count: usize,
    tests: Vec<(TestDescription, TestResult)>,
    run_failures: Vec<String>,
    elapsed: Duration,
    metrics: Metrics,
    complete: bool,
}

impl TestRunResult {
    /// Creates an empty run with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expected_count: 0,
            tests: Vec::new(),
            run_failures: Vec::new(),
            elapsed: Duration::ZERO,
            metrics: Metrics::new(),
            complete: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of tests the run announced it would execute.
    pub fn expected_count(&self) -> usize {
        self.expected_count
    }

    /// Test results in the order the tests were first reported.
    pub fn tests(&self) -> &[(TestDescription, TestResult)] {
        &self.tests
    }

    /// Number of tests that were actually reported.
    pub fn num_tests(&self) -> usize {
        self.tests.len()
    }

    /// Number of tests with the given status.
    pub fn num_tests_in_state(&self, status: TestStatus) -> usize {
        self.tests.iter().filter(|(_, r)| r.status == status).count()
    }

    /// Returns the result for `test`, if it was reported.
    pub fn result(&self, test: &TestDescription) -> Option<&TestResult> {
        self.tests.iter().find(|(d, _)| d == test).map(|(_, r)| r)
    }

    pub fn run_failures(&self) -> &[String] {
        &self.run_failures
    }

    pub fn is_run_failure(&self) -> bool {
        !self.run_failures.is_empty()
    }

    /// Returns `true` if any test failed or never completed.
    pub fn has_failed_tests(&self) -> bool {
        self.tests.iter().any(|(_, r)| !r.status.is_success())
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Returns `true` once `test_run_ended` was received.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    fn entry(&mut self, test: &TestDescription) -> &mut TestResult {
        let index = match self.tests.iter().position(|(d, _)| d == test) {
            Some(index) => index,
            None => {
                self.tests.push((test.clone(), TestResult::started()));
                self.tests.len() - 1
            }
        };
        &mut self.tests[index].1
    }

    /// Records a `test_run_started` event.
    pub fn run_started(&mut self, test_count: usize) {
        self.expected_count += test_count;
        self.complete = false;
    }

    pub fn test_started(&mut self, test: &TestDescription) {
        *self.entry(test) = TestResult::started();
    }

    pub fn test_failed(&mut self, test: &TestDescription, trace: &str) {
        let result = self.entry(test);
        result.status = TestStatus::Failure;
        result.stack_trace = Some(trace.to_string());
    }

    pub fn test_assumption_failure(&mut self, test: &TestDescription, trace: &str) {
        let result = self.entry(test);
        result.status = TestStatus::AssumptionFailure;
        result.stack_trace = Some(trace.to_string());
    }

    pub fn test_ignored(&mut self, test: &TestDescription) {
        self.entry(test).status = TestStatus::Ignored;
    }

    /// Records a `test_ended` event. A test with no recorded failure passes.
    pub fn test_ended(&mut self, test: &TestDescription, metrics: &Metrics) {
        let result = self.entry(test);
        if result.status == TestStatus::Incomplete {
            result.status = TestStatus::Passed;
        }
        if let Some(started) = result.started.take() {
            result.elapsed = started.elapsed();
        }
        result
            .metrics
            .extend(metrics.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    pub fn run_failed(&mut self, message: impl Into<String>) {
        self.run_failures.push(message.into());
    }

    /// Records a `test_run_ended` event.
    pub fn run_ended(&mut self, elapsed: Duration, metrics: &Metrics) {
        self.elapsed += elapsed;
        self.metrics
            .extend(metrics.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.complete = true;
    }
}

/// Kind of payload carried by a `test_log` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogDataType {
    Text,
    HostLog,
    DeviceLog,
    Bugreport,
}

impl LogDataType {
    /// File extension used when a log of this type is saved to disk.
    pub fn extension(&self) -> &'static str {
        match self {
            LogDataType::Bugreport => "zip.txt",
            _ => "txt",
        }
    }
}

/// Captured log payload.
///
/// Cheap to clone, so shard listeners can forward logs without copying.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogStream {
    data: Arc<Vec<u8>>,
}

impl LogStream {
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Arc::new(data.into()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Lossy UTF-8 view of the payload.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}
