//! A module: one logical group of test units and their preparers.
//!
//! A [`ModuleDefinition`] goes through a fixed lifecycle and runs exactly
//! once:
//!
//! ```text
//! Created ──► Preparing ──► Running ──► TearingDown ──► Reported
//!                 │             ▲
//!                 └─ error ─────┘ (placeholder `PreparationError` test)
//! ```
//!
//! Teardown is never skipped, and results are always reported as one
//! aggregated test run named after the module.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::pool::TestPool;
use crate::build_info::BuildDescriptor;
use crate::context::InvocationContext;
use crate::device::{DeviceHandle, RecoveryMode};
use crate::error::{HarnessError, HarnessResult};
use crate::listener::TestListener;
use crate::preparer::TargetPreparer;
use crate::remote_test::TestInformation;
use crate::result::{LogDataType, LogStream, Metrics, TestDescription, TestRunResult, TestStatus};

/// Run metric: time spent in preparers, in milliseconds.
pub const PREPARATION_TIME: &str = "PREPARATION_TIME";

/// Run metric: time spent tearing down, in milliseconds.
pub const TEAR_DOWN_TIME: &str = "TEAR_DOWN_TIME";

/// Run metric: time spent running test units, in milliseconds.
pub const TEST_TIME: &str = "TEST_TIME";

/// Name of the placeholder test reported when preparation fails.
pub const PREPARATION_ERROR_TEST: &str = "PreparationError";

/// Lifecycle state of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Created,
    Preparing,
    Running,
    TearingDown,
    Reported,
}

/// One logical group of tests plus its target preparers.
pub struct ModuleDefinition {
    id: String,
    pool: TestPool,
    preparers: Vec<Box<dyn TargetPreparer>>,
    device: Option<DeviceHandle>,
    build: Option<BuildDescriptor>,
    collect_only: bool,
    run_results: Vec<TestRunResult>,
    expected_tests: usize,
    failed: bool,
    state: ModuleState,
}

impl ModuleDefinition {
    pub fn new(id: impl Into<String>, pool: TestPool, preparers: Vec<Box<dyn TargetPreparer>>) -> Self {
        Self {
            id: id.into(),
            pool,
            preparers,
            device: None,
            build: None,
            collect_only: false,
            run_results: Vec::new(),
            expected_tests: 0,
            failed: false,
            state: ModuleState::Created,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_device(&mut self, device: Option<DeviceHandle>) {
        self.device = device;
    }

    pub fn set_build(&mut self, build: Option<BuildDescriptor>) {
        self.build = build;
    }

    pub fn set_collect_only(&mut self, collect_only: bool) {
        self.collect_only = collect_only;
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    /// Returns `true` if preparation failed, the run reported failures, or
    /// fewer tests ran than expected.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Returns `true` while the shared pool still holds units.
    pub fn has_pending_tests(&self) -> bool {
        !self.pool.is_empty()
    }

    pub fn pool(&self) -> &TestPool {
        &self.pool
    }

    pub fn preparers(&self) -> &[Box<dyn TargetPreparer>] {
        &self.preparers
    }

    /// Per-unit results recorded so far.
    pub fn test_run_results(&self) -> &[TestRunResult] {
        &self.run_results
    }

    /// Runs the module to completion.
    ///
    /// Results are reported to `listener`; test failures are also sent to
    /// `failure_listener` as they happen.
    ///
    /// # Errors
    ///
    /// Only [`HarnessError::DeviceNotAvailable`] is returned, after teardown
    /// and reporting are done. Every other failure is reported through the
    /// listener.
    pub async fn run(
        &mut self,
        context: &InvocationContext,
        listener: &dyn TestListener,
        failure_listener: Option<&dyn TestListener>,
    ) -> HarnessResult<()> {
        if self.state != ModuleState::Created {
            return Err(HarnessError::Runtime(format!(
                "module {} was already run",
                self.id
            )));
        }
        let start = Instant::now();

        self.state = ModuleState::Preparing;
        let preparation_start = Instant::now();
        let mut preparation_error = None;
        let mut fatal_error = None;
        match self.prepare().await {
            Ok(()) => {}
            Err(e) if e.is_device_not_available() => fatal_error = Some(e),
            Err(e) => preparation_error = Some(e),
        }
        if preparation_error.is_some() || fatal_error.is_some() {
            self.failed = true;
        }
        let preparation_time = preparation_start.elapsed();

        self.state = ModuleState::Running;
        let test_start = Instant::now();
        if let Some(e) = &preparation_error {
            error!("Module {} failed preparation: {}", self.id, e);
            self.record_preparation_failure(e, failure_listener).await;
        } else if fatal_error.is_none() {
            fatal_error = self.run_units(context, listener, failure_listener).await;
        }
        let test_time = test_start.elapsed();

        if fatal_error.is_some() {
            context.set_recovery_mode_for_all_devices(RecoveryMode::None);
            if let Some(device) = &self.device {
                device.set_recovery_mode(RecoveryMode::None);
            }
        }

        self.state = ModuleState::TearingDown;
        let teardown_start = Instant::now();
        let cause = preparation_error.as_ref().or(fatal_error.as_ref());
        let teardown_error = self.tear_down(cause).await;
        let teardown_time = teardown_start.elapsed();

        self.report_final_results(
            listener,
            start.elapsed(),
            preparation_time,
            test_time,
            teardown_time,
        )
        .await;
        self.state = ModuleState::Reported;

        match (fatal_error, teardown_error) {
            (Some(e), _) => Err(e),
            (None, Some(e)) if preparation_error.is_none() => Err(e),
            (None, Some(e)) => {
                warn!("Module {} lost its device during teardown: {}", self.id, e);
                Ok(())
            }
            (None, None) => Ok(()),
        }
    }

    async fn prepare(&self) -> HarnessResult<()> {
        if self.preparers.is_empty() {
            return Ok(());
        }
        let Some(device) = &self.device else {
            return Err(HarnessError::TargetSetup {
                serial: None,
                message: format!("module {} has preparers but no device", self.id),
            });
        };
        let build = self.build.clone().unwrap_or_default();
        for preparer in &self.preparers {
            debug!("Module {}: running preparer {}", self.id, preparer.name());
            preparer.set_up(device, &build).await?;
        }
        Ok(())
    }

    async fn record_preparation_failure(
        &mut self,
        cause: &HarnessError,
        failure_listener: Option<&dyn TestListener>,
    ) {
        let test = TestDescription::new(&self.id, PREPARATION_ERROR_TEST);
        let trace = cause.to_string();
        let mut run = TestRunResult::new(&self.id);
        run.run_started(1);
        run.test_started(&test);
        run.test_failed(&test, &trace);
        run.test_ended(&test, &Metrics::new());
        run.run_failed(trace.clone());
        run.run_ended(Duration::ZERO, &Metrics::new());
        self.expected_tests += 1;
        self.run_results.push(run);

        if let Some(failures) = failure_listener {
            failures.test_failed(&test, &trace).await;
        }
    }

    /// Drains the pool, returning the error that aborted the module, if any.
    async fn run_units(
        &mut self,
        context: &InvocationContext,
        listener: &dyn TestListener,
        failure_listener: Option<&dyn TestListener>,
    ) -> Option<HarnessError> {
        while let Some(unit) = self.pool.poll() {
            let info = TestInformation::inject(
                context,
                unit.capabilities(),
                self.device.as_ref(),
                self.build.as_ref(),
                self.collect_only,
            );
            let collector = ModuleListener::new(unit.name(), listener, failure_listener);
            let result = unit.run(&info, &collector).await;
            let mut run = collector.into_result();

            let fatal = match result {
                Ok(()) => None,
                Err(e) if e.is_device_not_available() => {
                    error!("Module {}: device lost while running {}: {}", self.id, unit.name(), e);
                    run.run_failed(e.to_string());
                    Some(e)
                }
                Err(e @ HarnessError::DeviceUnresponsive { .. }) => {
                    warn!("Module {}: device recovered during {}: {}", self.id, unit.name(), e);
                    run.run_failed(e.to_string());
                    None
                }
                Err(e) => {
                    error!("Module {}: {} failed: {}", self.id, unit.name(), e);
                    run.run_failed(e.to_string());
                    None
                }
            };
            self.expected_tests += run.expected_count();
            self.run_results.push(run);

            if let Some(e) = fatal {
                self.failed = true;
                return Some(e);
            }
        }
        None
    }

    /// Tears down every teardown-capable preparer in reverse order.
    ///
    /// Returns a device-not-available error raised during teardown. Other
    /// teardown errors are logged.
    async fn tear_down(&self, cause: Option<&HarnessError>) -> Option<HarnessError> {
        let Some(device) = &self.device else {
            return None;
        };
        let build = self.build.clone().unwrap_or_default();
        let mut device_error = None;
        for preparer in self.preparers.iter().rev().filter(|p| p.supports_teardown()) {
            if let Err(e) = preparer.tear_down(device, &build, cause).await {
                if e.is_device_not_available() {
                    error!("Module {}: device lost tearing down {}: {}", self.id, preparer.name(), e);
                    device_error.get_or_insert(e);
                } else {
                    warn!("Module {}: teardown of {} failed: {}", self.id, preparer.name(), e);
                }
            }
        }
        device_error
    }

    async fn report_final_results(
        &mut self,
        listener: &dyn TestListener,
        elapsed: Duration,
        preparation_time: Duration,
        test_time: Duration,
        teardown_time: Duration,
    ) {
        let mut metrics = Metrics::new();
        metrics.insert(PREPARATION_TIME.into(), preparation_time.as_millis().to_string());
        metrics.insert(TEAR_DOWN_TIME.into(), teardown_time.as_millis().to_string());
        metrics.insert(TEST_TIME.into(), test_time.as_millis().to_string());

        listener.test_run_started(&self.id, self.expected_tests).await;

        let mut run_failures = Vec::new();
        let mut reported = 0;
        for run in &self.run_results {
            for (test, result) in run.tests() {
                listener.test_started(test).await;
                let trace = result.stack_trace.as_deref().unwrap_or_default();
                match result.status {
                    TestStatus::Passed => {}
                    TestStatus::Failure => listener.test_failed(test, trace).await,
                    TestStatus::AssumptionFailure => {
                        listener.test_assumption_failure(test, trace).await
                    }
                    TestStatus::Ignored => listener.test_ignored(test).await,
                    TestStatus::Incomplete => {
                        listener.test_failed(test, "Test did not complete").await
                    }
                }
                listener.test_ended(test, &result.metrics).await;
                reported += 1;
            }
            run_failures.extend(run.run_failures().iter().cloned());
        }

        if reported < self.expected_tests {
            run_failures.push(format!(
                "Module {} only ran {} out of {} expected tests.",
                self.id, reported, self.expected_tests
            ));
        }
        if !run_failures.is_empty() {
            self.failed = true;
            listener.test_run_failed(&run_failures.join("\n")).await;
        }

        info!(
            "Module {} done: {} tests in {:?}{}",
            self.id,
            reported,
            elapsed,
            if self.failed { " (failed)" } else { "" }
        );
        listener.test_run_ended(elapsed, &metrics).await;
    }
}

/// Per-unit collector.
///
/// Folds result events into a [`TestRunResult`], forwards logs straight
/// to the module's listener and failures to the failure listener.
struct ModuleListener<'a> {
    run: Mutex<TestRunResult>,
    main: &'a dyn TestListener,
    failures: Option<&'a dyn TestListener>,
}

impl<'a> ModuleListener<'a> {
    fn new(
        name: &str,
        main: &'a dyn TestListener,
        failures: Option<&'a dyn TestListener>,
    ) -> Self {
        Self {
            run: Mutex::new(TestRunResult::new(name)),
            main,
            failures,
        }
    }

    fn with_run(&self, f: impl FnOnce(&mut TestRunResult)) {
        f(&mut self.run.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn into_result(self) -> TestRunResult {
        self.run.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl TestListener for ModuleListener<'_> {
    async fn test_run_started(&self, _run_name: &str, test_count: usize) {
        self.with_run(|run| run.run_started(test_count));
    }

    async fn test_started(&self, test: &TestDescription) {
        self.with_run(|run| run.test_started(test));
    }

    async fn test_failed(&self, test: &TestDescription, trace: &str) {
        self.with_run(|run| run.test_failed(test, trace));
        if let Some(failures) = self.failures {
            failures.test_failed(test, trace).await;
        }
    }

    async fn test_assumption_failure(&self, test: &TestDescription, trace: &str) {
        self.with_run(|run| run.test_assumption_failure(test, trace));
    }

    async fn test_ignored(&self, test: &TestDescription) {
        self.with_run(|run| run.test_ignored(test));
    }

    async fn test_ended(&self, test: &TestDescription, metrics: &Metrics) {
        self.with_run(|run| run.test_ended(test, metrics));
    }

    async fn test_run_failed(&self, message: &str) {
        self.with_run(|run| run.run_failed(message));
        if let Some(failures) = self.failures {
            failures.test_run_failed(message).await;
        }
    }

    async fn test_run_ended(&self, elapsed: Duration, metrics: &Metrics) {
        self.with_run(|run| run.run_ended(elapsed, metrics));
    }

    async fn test_log(&self, name: &str, data_type: LogDataType, stream: &LogStream) {
        self.main.test_log(name, data_type, stream).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::device::{Command, Device, StubDevice};
    use crate::listener::{CollectingListener, InvocationEvent};
    use crate::remote_test::{RemoteTest, ShellCase, ShellTest, TestCapabilities, TestHandle};

    /// Preparer that records set-up and tear-down calls in a shared journal.
    #[derive(Clone)]
    struct Recorder {
        name: String,
        journal: Arc<Mutex<Vec<String>>>,
        fail_setup: bool,
        teardown: bool,
    }

    impl Recorder {
        fn new(name: &str, journal: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                journal: journal.clone(),
                fail_setup: false,
                teardown: true,
            }
        }
    }

    #[async_trait]
    impl TargetPreparer for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn set_up(&self, device: &DeviceHandle, _build: &BuildDescriptor) -> HarnessResult<()> {
            self.journal.lock().unwrap().push(format!("setup:{}", self.name));
            if self.fail_setup {
                return Err(HarnessError::target_setup(device.serial(), "flash failed"));
            }
            Ok(())
        }

        fn supports_teardown(&self) -> bool {
            self.teardown
        }

        async fn tear_down(
            &self,
            _device: &DeviceHandle,
            _build: &BuildDescriptor,
            cause: Option<&HarnessError>,
        ) -> HarnessResult<()> {
            self.journal.lock().unwrap().push(format!(
                "teardown:{}:{}",
                self.name,
                if cause.is_some() { "err" } else { "ok" }
            ));
            Ok(())
        }

        fn clone_box(&self) -> Box<dyn TargetPreparer> {
            Box::new(self.clone())
        }
    }

    /// Unit that announces more tests than it reports, or fails outright.
    struct Scripted {
        name: String,
        announce: usize,
        report: usize,
        error: Option<fn() -> HarnessError>,
    }

    #[async_trait]
    impl RemoteTest for Scripted {
        fn name(&self) -> &str {
            &self.name
        }

        fn capabilities(&self) -> TestCapabilities {
            TestCapabilities {
                device_bound: true,
                ..Default::default()
            }
        }

        async fn run(
            &self,
            _info: &TestInformation<'_>,
            listener: &dyn TestListener,
        ) -> HarnessResult<()> {
            listener.test_run_started(&self.name, self.announce).await;
            for i in 0..self.report {
                let test = TestDescription::new(&self.name, format!("t{}", i));
                listener.test_started(&test).await;
                listener.test_ended(&test, &Metrics::new()).await;
            }
            if let Some(error) = self.error {
                return Err(error());
            }
            listener.test_run_ended(Duration::ZERO, &Metrics::new()).await;
            Ok(())
        }
    }

    fn stub() -> DeviceHandle {
        Arc::new(StubDevice::new("stub-0"))
    }

    fn module(units: Vec<TestHandle>, preparers: Vec<Box<dyn TargetPreparer>>) -> ModuleDefinition {
        let mut module = ModuleDefinition::new("mod", TestPool::new(units), preparers);
        module.set_device(Some(stub()));
        module.set_build(Some(BuildDescriptor::new("b1")));
        module
    }

    fn shell_unit(name: &str, cases: &[&str]) -> TestHandle {
        Arc::new(ShellTest::new(
            name,
            cases
                .iter()
                .map(|c| ShellCase::new(*c, Command::new("true")))
                .collect(),
        ))
    }

    fn run_failures(listener: &CollectingListener) -> Vec<String> {
        listener
            .events()
            .into_iter()
            .filter_map(|e| match e {
                InvocationEvent::RunFailed(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_runs_units_and_reports_one_run() {
        let context = InvocationContext::new("cfg");
        let listener = CollectingListener::new();
        let mut module = module(
            vec![shell_unit("a", &["1", "2"]), shell_unit("b", &["3"])],
            Vec::new(),
        );

        module.run(&context, &listener, None).await.unwrap();

        assert_eq!(module.state(), ModuleState::Reported);
        assert!(!module.is_failed());
        assert!(!module.has_pending_tests());
        let runs = listener.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].name(), "mod");
        assert_eq!(runs[0].expected_count(), 3);
        assert_eq!(runs[0].num_tests_in_state(TestStatus::Passed), 3);
        for key in [PREPARATION_TIME, TEAR_DOWN_TIME, TEST_TIME] {
            assert!(runs[0].metrics().contains_key(key));
        }
    }

    #[tokio::test]
    async fn test_prepared_module_reports_every_event() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let preparers: Vec<Box<dyn TargetPreparer>> = vec![
            Box::new(Recorder::new("p1", &journal)),
            Box::new(Recorder::new("p2", &journal)),
        ];
        let unit: TestHandle = Arc::new(Scripted {
            name: "unit".into(),
            announce: 3,
            report: 3,
            error: None,
        });
        let context = InvocationContext::new("cfg");
        let listener = CollectingListener::new();
        let mut module = module(vec![unit], preparers);

        module.run(&context, &listener, None).await.unwrap();

        let events: Vec<InvocationEvent> = listener
            .events()
            .into_iter()
            .filter(|e| !e.is_log())
            .collect();
        assert_eq!(events.len(), 8);
        assert!(matches!(
            &events[0],
            InvocationEvent::RunStarted { name, test_count: 3 } if name == "mod"
        ));
        for pair in events[1..7].chunks(2) {
            match (&pair[0], &pair[1]) {
                (InvocationEvent::TestStarted(started), InvocationEvent::TestEnded(ended, _)) => {
                    assert_eq!(started, ended)
                }
                other => panic!("unexpected events {:?}", other),
            }
        }
        let InvocationEvent::RunEnded(_, metrics) = &events[7] else {
            panic!("expected run end, got {:?}", events[7]);
        };
        for key in [PREPARATION_TIME, TEAR_DOWN_TIME, TEST_TIME] {
            assert!(metrics.contains_key(key));
        }
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["setup:p1", "setup:p2", "teardown:p2:ok", "teardown:p1:ok"]
        );
        assert!(!module.is_failed());
    }

    #[tokio::test]
    async fn test_first_preparer_failure_still_tears_down_all() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut failing = Recorder::new("p1", &journal);
        failing.fail_setup = true;
        let preparers: Vec<Box<dyn TargetPreparer>> = vec![
            Box::new(failing),
            Box::new(Recorder::new("p2", &journal)),
            Box::new(Recorder::new("p3", &journal)),
        ];
        let context = InvocationContext::new("cfg");
        let listener = CollectingListener::new();
        let mut module = module(vec![shell_unit("a", &["1"])], preparers);

        module.run(&context, &listener, None).await.unwrap();

        assert_eq!(
            *journal.lock().unwrap(),
            vec!["setup:p1", "teardown:p3:err", "teardown:p2:err", "teardown:p1:err"]
        );
        assert!(module.is_failed());
        assert_eq!(listener.runs()[0].tests()[0].0.test_name, PREPARATION_ERROR_TEST);
    }

    #[tokio::test]
    async fn test_teardown_in_reverse_order_with_cause() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut failing = Recorder::new("p2", &journal);
        failing.fail_setup = true;
        let mut no_teardown = Recorder::new("p3", &journal);
        no_teardown.teardown = false;
        let preparers: Vec<Box<dyn TargetPreparer>> = vec![
            Box::new(Recorder::new("p1", &journal)),
            Box::new(failing),
            Box::new(no_teardown),
            Box::new(Recorder::new("p4", &journal)),
        ];
        let context = InvocationContext::new("cfg");
        let listener = CollectingListener::new();
        let mut module = module(vec![shell_unit("a", &["1"])], preparers);

        module.run(&context, &listener, None).await.unwrap();

        assert_eq!(
            *journal.lock().unwrap(),
            vec![
                "setup:p1",
                "setup:p2",
                "teardown:p4:err",
                "teardown:p2:err",
                "teardown:p1:err",
            ]
        );
        assert!(module.is_failed());
        assert!(module.has_pending_tests());
    }

    #[tokio::test]
    async fn test_preparation_error_reports_placeholder() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut failing = Recorder::new("flash", &journal);
        failing.fail_setup = true;
        let context = InvocationContext::new("cfg");
        let listener = CollectingListener::new();
        let failures = CollectingListener::new();
        let mut module = module(vec![shell_unit("a", &["1"])], vec![Box::new(failing)]);

        module.run(&context, &listener, Some(&failures)).await.unwrap();

        let runs = listener.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].num_tests(), 1);
        let (test, result) = &runs[0].tests()[0];
        assert_eq!(test.test_name, PREPARATION_ERROR_TEST);
        assert_eq!(result.status, TestStatus::Failure);
        assert!(runs[0].metrics().contains_key(PREPARATION_TIME));
        assert_eq!(failures.runs().len(), 0);
        assert_eq!(
            failures.count(|e| matches!(e, InvocationEvent::TestFailed(..))),
            1
        );
    }

    #[tokio::test]
    async fn test_shortfall_is_reported_once() {
        let context = InvocationContext::new("cfg");
        let listener = CollectingListener::new();
        let unit: TestHandle = Arc::new(Scripted {
            name: "short".into(),
            announce: 5,
            report: 4,
            error: None,
        });
        let mut module = module(vec![unit], Vec::new());

        module.run(&context, &listener, None).await.unwrap();

        let failures = run_failures(&listener);
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("only ran 4 out of 5 expected tests"));
        assert!(module.is_failed());
    }

    #[tokio::test]
    async fn test_runtime_error_moves_to_next_unit() {
        let context = InvocationContext::new("cfg");
        let listener = CollectingListener::new();
        let crashing: TestHandle = Arc::new(Scripted {
            name: "crash".into(),
            announce: 1,
            report: 1,
            error: Some(|| HarnessError::Runtime("segfault".into())),
        });
        let mut module = module(vec![crashing, shell_unit("next", &["ok"])], Vec::new());

        module.run(&context, &listener, None).await.unwrap();

        assert_eq!(listener.runs()[0].num_tests(), 2);
        assert!(run_failures(&listener)[0].contains("segfault"));
    }

    #[tokio::test]
    async fn test_device_loss_aborts_after_teardown_and_report() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let context = InvocationContext::new("cfg");
        let listener = CollectingListener::new();
        let lost: TestHandle = Arc::new(Scripted {
            name: "lost".into(),
            announce: 2,
            report: 1,
            error: Some(|| HarnessError::device_not_available("stub-0", "usb reset")),
        });
        let mut module = module(
            vec![lost, shell_unit("never", &["x"])],
            vec![Box::new(Recorder::new("p1", &journal))],
        );
        let device = Arc::new(StubDevice::new("stub-0"));
        let handle: DeviceHandle = device.clone();
        module.set_device(Some(handle));

        let err = module.run(&context, &listener, None).await.unwrap_err();

        assert!(err.is_device_not_available());
        assert_eq!(device.recovery_mode(), RecoveryMode::None);
        assert!(module.has_pending_tests());
        assert_eq!(journal.lock().unwrap().last().map(String::as_str), Some("teardown:p1:err"));
        let runs = listener.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].num_tests(), 1);
        assert!(runs[0].is_complete());
    }

    #[tokio::test]
    async fn test_module_runs_only_once() {
        let context = InvocationContext::new("cfg");
        let listener = CollectingListener::new();
        let mut module = module(Vec::new(), Vec::new());
        module.run(&context, &listener, None).await.unwrap();
        assert!(module.run(&context, &listener, None).await.is_err());
    }
}
