//! Invocation driver.
//!
//! A [`TestInvocation`] takes one [`Configuration`] through its whole
//! lifecycle:
//!
//! ```text
//!  fetch builds ──► shard? ──yes──► schedule shards, stop
//!                     │
//!                     no
//!                     ▼
//!   invocation_started ─► set up ─► run tests ─► tear down ─► clean up ─► invocation_ended
//!                                      │                           ▲
//!                                      └── device lost: resume ────┘
//! ```
//!
//! Teardown, cleanup and the host log report always happen, whatever the
//! earlier stages did. Follow-up work (shards, resumed runs, retries) is
//! never run here; it goes to the [`Rescheduler`].

pub mod configuration;
pub mod rescheduler;
pub mod resume;

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::build_info::ExistingBuildProvider;
use crate::context::InvocationContext;
use crate::device::RecoveryMode;
use crate::error::{FailureDescription, HarnessError, HarnessResult};
use crate::listener::{ResultForwarder, TestListener};
use crate::logging::{CaptureId, HostLog};
use crate::remote_test::TestInformation;
use crate::result::{LogDataType, LogStream};
use crate::shard::{ShardHelper, ShardOutcome, ShardStrategy};

pub use configuration::{Configuration, DeviceConfig};
pub use rescheduler::{NoopRescheduler, QueueRescheduler, Rescheduler};
pub use resume::ResumeResultForwarder;

/// Name of the consolidated host log sent at the end of an invocation.
pub const HOST_LOG_NAME: &str = "host_log";

/// How an invocation finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationStatus {
    /// Not finished yet.
    Pending,
    Success,
    /// A preparer or test failed the invocation.
    Failed,
    /// No build was available; the command was rescheduled.
    NoBuild,
    BuildRetrievalError,
    /// A device went away and the invocation could not be resumed.
    DeviceUnavailable,
    /// Split into shards that run as separate invocations.
    Sharded,
    /// A device went away and the remaining tests were rescheduled.
    Resumed,
}

impl InvocationStatus {
    /// Process exit code for this status.
    pub fn exit_code(&self) -> i32 {
        match self {
            InvocationStatus::Success | InvocationStatus::Sharded | InvocationStatus::Resumed => 0,
            InvocationStatus::Pending | InvocationStatus::Failed => 1,
            InvocationStatus::DeviceUnavailable => 2,
            InvocationStatus::BuildRetrievalError => 3,
            InvocationStatus::NoBuild => 4,
        }
    }
}

/// Log stage used when naming captured device logs.
#[derive(Debug, Clone, Copy)]
enum Stage {
    Setup,
    Test,
    Teardown,
    Error,
}

impl Stage {
    fn as_str(&self) -> &'static str {
        match self {
            Stage::Setup => "setup",
            Stage::Test => "test",
            Stage::Teardown => "teardown",
            Stage::Error => "error",
        }
    }
}

/// Drives a single invocation end to end.
pub struct TestInvocation {
    host_log: HostLog,
    shard_strategy: Arc<dyn ShardStrategy>,
    status: InvocationStatus,
    resumed: bool,
    shard_aggregation: Option<JoinHandle<()>>,
}

impl TestInvocation {
    pub fn new(host_log: HostLog) -> Self {
        Self {
            host_log,
            shard_strategy: Arc::new(ShardHelper),
            status: InvocationStatus::Pending,
            resumed: false,
            shard_aggregation: None,
        }
    }

    pub fn with_shard_strategy(mut self, strategy: Arc<dyn ShardStrategy>) -> Self {
        self.shard_strategy = strategy;
        self
    }

    pub fn status(&self) -> InvocationStatus {
        self.status
    }

    /// The task aggregating shard results, if this invocation was sharded.
    ///
    /// It completes once every scheduled shard has finished.
    pub fn take_shard_aggregation(&mut self) -> Option<JoinHandle<()>> {
        self.shard_aggregation.take()
    }

    /// Runs `config` against the devices it names.
    ///
    /// # Errors
    ///
    /// Preparation errors are reported to the listeners and not returned.
    /// [`HarnessError::DeviceNotAvailable`] and unexpected errors are
    /// returned after teardown and reporting have completed.
    pub async fn invoke(
        &mut self,
        context: &mut InvocationContext,
        config: &Configuration,
        rescheduler: &dyn Rescheduler,
    ) -> HarnessResult<()> {
        context.set_test_tag(&config.options.test_tag);
        for slot in &config.devices {
            context.add_device(&slot.name, slot.device.clone());
        }

        if !self.fetch_builds(context, config, rescheduler).await {
            return Ok(());
        }

        match self
            .shard_strategy
            .shard_config(config, context, rescheduler)
            .await?
        {
            ShardOutcome::Sharded(task) => {
                info!("Invocation {} was sharded", context.invocation_id());
                self.shard_aggregation = Some(task);
                self.status = InvocationStatus::Sharded;
                return Ok(());
            }
            ShardOutcome::NotSharded => {}
        }

        self.perform_invocation(context, config, rescheduler).await
    }

    /// Returns `false` when the invocation must stop.
    async fn fetch_builds(
        &mut self,
        context: &mut InvocationContext,
        config: &Configuration,
        rescheduler: &dyn Rescheduler,
    ) -> bool {
        for slot in &config.devices {
            match slot.build_provider.fetch_build(Some(&slot.device)).await {
                Ok(Some(build)) => {
                    debug!("Device {}: testing build {}", slot.name, build.build_id);
                    context.add_build_info(&slot.name, build);
                }
                Ok(None) => {
                    warn!("No build found for device {}, rescheduling", slot.name);
                    for (name, build) in context.named_build_infos() {
                        if let Some(owner) = config.devices.iter().find(|d| d.name == name) {
                            owner.build_provider.mark_build_untested(&build).await;
                        }
                    }
                    if !rescheduler.reschedule_command() {
                        warn!("Command could not be rescheduled");
                    }
                    self.status = InvocationStatus::NoBuild;
                    return false;
                }
                Err(err) => {
                    error!("Build retrieval failed for device {}: {}", slot.name, err);
                    self.report_build_failure(context, config, &err).await;
                    self.status = InvocationStatus::BuildRetrievalError;
                    return false;
                }
            }
        }
        true
    }

    async fn report_build_failure(
        &self,
        context: &InvocationContext,
        config: &Configuration,
        err: &HarnessError,
    ) {
        let capture = self.host_log.open_capture();
        let started = Instant::now();
        let listener = config.listener();
        listener.invocation_started(context).await;
        listener
            .invocation_failed(&FailureDescription::from(err))
            .await;
        self.release_builds(context, config).await;
        self.report_host_log(&listener, capture).await;
        listener.invocation_ended(started.elapsed()).await;
    }

    async fn perform_invocation(
        &mut self,
        context: &mut InvocationContext,
        config: &Configuration,
        rescheduler: &dyn Rescheduler,
    ) -> HarnessResult<()> {
        let capture = self.host_log.open_capture();
        let host_log = self.host_log.clone();
        host_log
            .scope(capture, self.run_invocation(context, config, rescheduler, capture))
            .await
    }

    async fn run_invocation(
        &mut self,
        context: &mut InvocationContext,
        config: &Configuration,
        rescheduler: &dyn Rescheduler,
        capture: CaptureId,
    ) -> HarnessResult<()> {
        let started = Instant::now();
        let listener = config.listener();
        info!(
            "Starting invocation {} of `{}`",
            context.invocation_id(),
            config.name
        );

        listener.invocation_started(context).await;
        record_battery(context, "initial").await;

        let result = self
            .prepare_and_run(context, config, &listener, rescheduler, started)
            .await;

        if let Err(err) = &result {
            self.report_failure(context, &listener, err).await;
        }

        record_battery(context, "final").await;
        if !self.resumed {
            self.release_builds(context, config).await;
        }
        self.report_host_log(&listener, capture).await;
        if self.resumed {
            info!("Invocation {} continues in a resumed run", context.invocation_id());
        } else {
            listener.invocation_ended(started.elapsed()).await;
        }

        match result {
            Ok(()) => {
                self.status = InvocationStatus::Success;
                Ok(())
            }
            Err(err) if err.is_preparation_error() => {
                self.status = InvocationStatus::Failed;
                Ok(())
            }
            Err(err) if err.is_device_not_available() => {
                self.status = if self.resumed {
                    InvocationStatus::Resumed
                } else {
                    InvocationStatus::DeviceUnavailable
                };
                Err(err)
            }
            Err(err) => {
                self.status = InvocationStatus::Failed;
                Err(err)
            }
        }
    }

    async fn prepare_and_run(
        &mut self,
        context: &InvocationContext,
        config: &Configuration,
        listener: &ResultForwarder,
        rescheduler: &dyn Rescheduler,
        started: Instant,
    ) -> HarnessResult<()> {
        let run_result = match do_setup(context, config).await {
            Ok(()) => {
                capture_device_logs(context, listener, Stage::Setup).await;
                let result = self
                    .run_tests(context, config, listener, rescheduler, started)
                    .await;
                capture_device_logs(context, listener, Stage::Test).await;
                result
            }
            Err(err) => {
                error!("Setup failed: {}", err);
                capture_device_logs(context, listener, Stage::Error).await;
                Err(err)
            }
        };

        if matches!(&run_result, Err(err) if err.is_device_not_available()) {
            context.set_recovery_mode_for_all_devices(RecoveryMode::None);
        }
        let teardown_result = do_teardown(context, config, run_result.as_ref().err()).await;
        capture_device_logs(context, listener, Stage::Teardown).await;

        match (run_result, teardown_result) {
            (Err(err), Err(teardown_err)) => {
                warn!("Teardown also failed: {}", teardown_err);
                Err(err)
            }
            (Err(err), Ok(())) | (Ok(()), Err(err)) => Err(err),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    async fn run_tests(
        &mut self,
        context: &InvocationContext,
        config: &Configuration,
        listener: &ResultForwarder,
        rescheduler: &dyn Rescheduler,
        started: Instant,
    ) -> HarnessResult<()> {
        let slot = config.devices.first();
        let device = slot.map(|s| &s.device);
        let build = slot.and_then(|s| context.build_info(&s.name));

        for (index, test) in config.tests.iter().enumerate() {
            let info = TestInformation::inject(
                context,
                test.capabilities(),
                device,
                build,
                config.options.collect_only,
            );
            debug!("Running test {}", test.name());
            match test.run(&info, listener).await {
                Ok(()) => {}
                Err(err @ HarnessError::DeviceUnresponsive { .. }) => {
                    warn!("Test {} ended early: {}", test.name(), err);
                }
                Err(err) if err.is_device_not_available() => {
                    error!("Device lost while running {}: {}", test.name(), err);
                    self.handle_device_lost(context, config, index, rescheduler, started);
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Resumes the tests from `failed_index` onward if any of them can be
    /// resumed, otherwise asks for a retry if one of them is retriable.
    fn handle_device_lost(
        &mut self,
        context: &InvocationContext,
        config: &Configuration,
        failed_index: usize,
        rescheduler: &dyn Rescheduler,
        started: Instant,
    ) {
        let remaining = &config.tests[failed_index..];
        let resumable = remaining.iter().any(|t| t.capabilities().resumable);
        let max_attempts = config.options.max_command_retries;

        if resumable && config.attempt < max_attempts {
            let mut resumed = config.clone();
            resumed.tests = remaining.to_vec();
            resumed.attempt = config.attempt + 1;
            resumed.listeners = vec![Arc::new(ResumeResultForwarder::new(
                config.listener(),
                started.elapsed(),
            ))];
            for slot in &mut resumed.devices {
                if let Some(build) = context.build_info(&slot.name) {
                    slot.build_provider = Arc::new(ExistingBuildProvider::new(
                        build.clone(),
                        slot.build_provider.clone(),
                    ));
                }
            }
            if rescheduler.schedule_config(resumed) {
                info!(
                    "Resuming {} remaining tests (attempt {})",
                    remaining.len(),
                    config.attempt + 1
                );
                self.resumed = true;
                return;
            }
            warn!("Resumed configuration was not accepted");
        }

        let retriable = remaining.iter().any(|t| t.capabilities().retriable);
        if retriable && !config.options.loop_mode && rescheduler.reschedule_command() {
            info!("Requested a retry of the whole command");
        }
    }

    async fn report_failure(
        &self,
        context: &InvocationContext,
        listener: &ResultForwarder,
        err: &HarnessError,
    ) {
        if !self.resumed {
            listener
                .invocation_failed(&FailureDescription::from(err))
                .await;
        }

        let Some(category) = err.bugreport_category() else {
            return;
        };
        let devices = match err.device_serial().and_then(|s| context.device_by_serial(s)) {
            Some(device) => vec![device],
            None => context.devices(),
        };
        for device in devices.iter().filter(|d| !d.is_stub()) {
            let label = context.device_name(device).unwrap_or(device.serial());
            match device.take_bugreport().await {
                Ok(Some(report)) => {
                    let name = format!("{}_{}", category.as_str(), device.serial());
                    debug!("Captured {} for device {}", name, label);
                    listener
                        .test_log(&name, LogDataType::Bugreport, &report)
                        .await;
                }
                Ok(None) => debug!("Device {} has no bugreport", label),
                Err(err) => warn!("Bugreport of {} failed: {}", label, err),
            }
        }
    }

    async fn release_builds(&self, context: &InvocationContext, config: &Configuration) {
        for slot in &config.devices {
            if let Some(build) = context.build_info(&slot.name) {
                slot.build_provider.release_build(build).await;
            }
        }
    }

    async fn report_host_log(&self, listener: &ResultForwarder, capture: CaptureId) {
        let stream = LogStream::from_bytes(self.host_log.close_capture(capture));
        listener
            .test_log(HOST_LOG_NAME, LogDataType::HostLog, &stream)
            .await;
    }
}

async fn do_setup(context: &InvocationContext, config: &Configuration) -> HarnessResult<()> {
    for slot in &config.devices {
        let Some(build) = context.build_info(&slot.name) else {
            continue;
        };
        for preparer in &slot.preparers {
            info!("Device {}: setting up {}", slot.name, preparer.name());
            preparer.set_up(&slot.device, build).await?;
        }
    }
    for preparer in &config.multi_preparers {
        info!("Setting up {}", preparer.name());
        preparer.set_up(context).await?;
    }
    Ok(())
}

/// Tears everything down in reverse; returns the last failure.
async fn do_teardown(
    context: &InvocationContext,
    config: &Configuration,
    cause: Option<&HarnessError>,
) -> HarnessResult<()> {
    let mut last_error = None;

    for preparer in config.multi_preparers.iter().rev() {
        if !preparer.supports_teardown() {
            continue;
        }
        if let Err(err) = preparer.tear_down(context, cause).await {
            error!("Teardown of {} failed: {}", preparer.name(), err);
            last_error = Some(err);
        }
    }

    for slot in config.devices.iter().rev() {
        let Some(build) = context.build_info(&slot.name) else {
            continue;
        };
        for preparer in slot.preparers.iter().rev() {
            if !preparer.supports_teardown() {
                continue;
            }
            if let Err(err) = preparer.tear_down(&slot.device, build, cause).await {
                error!(
                    "Device {}: teardown of {} failed: {}",
                    slot.name,
                    preparer.name(),
                    err
                );
                last_error = Some(err);
            }
        }
    }

    match last_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn record_battery(context: &mut InvocationContext, stage: &str) {
    for (name, device) in context.named_devices() {
        if let Some(level) = device.battery_level().await {
            context.add_attribute(format!("{}-battery-{}", name, stage), level.to_string());
        }
    }
}

async fn capture_device_logs(context: &InvocationContext, listener: &dyn TestListener, stage: Stage) {
    for (name, device) in context.named_devices() {
        if device.is_stub() {
            continue;
        }
        match device.fetch_log_stream().await {
            Ok(stream) => {
                listener
                    .test_log(
                        &format!("device_log_{}_{}", stage.as_str(), name),
                        LogDataType::DeviceLog,
                        &stream,
                    )
                    .await;
                if let Err(err) = device.clear_log().await {
                    debug!("Could not clear log of {}: {}", name, err);
                }
            }
            Err(err) => warn!("Could not fetch log of {}: {}", name, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::build_info::{BuildDescriptor, BuildProvider, StaticBuildProvider};
    use crate::device::{Command, Device, DeviceHandle, StubDevice};
    use crate::listener::CollectingListener;
    use crate::preparer::TargetPreparer;
    use crate::remote_test::{RemoteTest, ShellCase, ShellTest, TestCapabilities};

    struct Recorder {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        fail_setup: bool,
        fail_teardown: bool,
    }

    #[async_trait]
    impl TargetPreparer for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn set_up(&self, device: &DeviceHandle, _build: &BuildDescriptor) -> HarnessResult<()> {
            self.log.lock().unwrap().push(format!("setup {}", self.name));
            if self.fail_setup {
                return Err(HarnessError::target_setup(device.serial(), "flash failed"));
            }
            Ok(())
        }

        fn supports_teardown(&self) -> bool {
            true
        }

        async fn tear_down(
            &self,
            _device: &DeviceHandle,
            _build: &BuildDescriptor,
            _cause: Option<&HarnessError>,
        ) -> HarnessResult<()> {
            self.log.lock().unwrap().push(format!("teardown {}", self.name));
            if self.fail_teardown {
                return Err(HarnessError::Runtime(format!("teardown {} failed", self.name)));
            }
            Ok(())
        }

        fn clone_box(&self) -> Box<dyn TargetPreparer> {
            Box::new(Recorder {
                name: self.name.clone(),
                log: self.log.clone(),
                fail_setup: self.fail_setup,
                fail_teardown: self.fail_teardown,
            })
        }
    }

    struct LosesDevice {
        resumable: bool,
    }

    #[async_trait]
    impl RemoteTest for LosesDevice {
        fn name(&self) -> &str {
            "loses-device"
        }

        fn capabilities(&self) -> TestCapabilities {
            TestCapabilities {
                device_bound: true,
                resumable: self.resumable,
                retriable: true,
                ..Default::default()
            }
        }

        async fn run(
            &self,
            _info: &TestInformation<'_>,
            _listener: &dyn TestListener,
        ) -> HarnessResult<()> {
            Err(HarnessError::device_not_available("s1", "usb reset"))
        }
    }

    fn base_config(collector: Arc<CollectingListener>, provider: Arc<dyn BuildProvider>) -> Configuration {
        let device: DeviceHandle = Arc::new(StubDevice::new("s1"));
        Configuration::new("cfg")
            .with_device(DeviceConfig::new("primary", device, provider))
            .with_listener(collector)
    }

    fn build() -> Arc<dyn BuildProvider> {
        Arc::new(StaticBuildProvider::new(BuildDescriptor::new("b1")))
    }

    #[tokio::test]
    async fn test_happy_path_reports_once() {
        let collector = Arc::new(CollectingListener::new());
        let config = base_config(collector.clone(), build()).with_test(Arc::new(ShellTest::new(
            "t",
            vec![ShellCase::new("a", Command::new("true"))],
        )));
        let mut context = InvocationContext::new("cfg");
        let mut invocation = TestInvocation::new(HostLog::new());

        invocation
            .invoke(&mut context, &config, &NoopRescheduler)
            .await
            .unwrap();

        assert_eq!(invocation.status(), InvocationStatus::Success);
        assert_eq!(collector.invocation_started_count(), 1);
        assert_eq!(collector.ended_invocations().len(), 1);
        assert!(collector.invocation_failures().is_empty());
        assert!(collector.log_names().contains(&HOST_LOG_NAME.to_string()));
        assert_eq!(context.build_info("primary").unwrap().build_id, "b1");
    }

    #[tokio::test]
    async fn test_preparation_error_is_contained_and_torn_down() {
        let collector = Arc::new(CollectingListener::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut config = base_config(collector.clone(), build());
        for (name, fail) in [("p1", false), ("p2", true), ("p3", false)] {
            config.devices[0].preparers.push(Box::new(Recorder {
                name: name.into(),
                log: log.clone(),
                fail_setup: fail,
                fail_teardown: false,
            }));
        }
        let mut context = InvocationContext::new("cfg");
        let mut invocation = TestInvocation::new(HostLog::new());

        invocation
            .invoke(&mut context, &config, &NoopRescheduler)
            .await
            .unwrap();

        assert_eq!(invocation.status(), InvocationStatus::Failed);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["setup p1", "setup p2", "teardown p3", "teardown p2", "teardown p1"]
        );
        assert_eq!(collector.invocation_failures().len(), 1);
        assert_eq!(collector.ended_invocations().len(), 1);
    }

    #[tokio::test]
    async fn test_no_build_reschedules_without_reporting() {
        let collector = Arc::new(CollectingListener::new());
        let config = base_config(collector.clone(), Arc::new(StaticBuildProvider::empty()));
        let rescheduler = QueueRescheduler::new();
        let mut invocation = TestInvocation::new(HostLog::new());

        invocation
            .invoke(&mut InvocationContext::new("cfg"), &config, &rescheduler)
            .await
            .unwrap();

        assert_eq!(invocation.status(), InvocationStatus::NoBuild);
        assert_eq!(rescheduler.take_retry_requests(), 1);
        assert!(collector.events().is_empty());
    }

    #[tokio::test]
    async fn test_build_retrieval_error_is_reported() {
        let collector = Arc::new(CollectingListener::new());
        let provider = Arc::new(StaticBuildProvider::new(
            BuildDescriptor::new("b1").with_file("image", "/nonexistent/devrun/image.bin"),
        ));
        let config = base_config(collector.clone(), provider);
        let mut invocation = TestInvocation::new(HostLog::new());

        invocation
            .invoke(&mut InvocationContext::new("cfg"), &config, &NoopRescheduler)
            .await
            .unwrap();

        assert_eq!(invocation.status(), InvocationStatus::BuildRetrievalError);
        assert_eq!(collector.invocation_started_count(), 1);
        assert_eq!(collector.invocation_failures().len(), 1);
        assert_eq!(collector.ended_invocations().len(), 1);
    }

    #[tokio::test]
    async fn test_device_loss_resumes_resumable_tests() {
        let collector = Arc::new(CollectingListener::new());
        let mut config = base_config(collector.clone(), build())
            .with_test(Arc::new(LosesDevice { resumable: true }));
        config.options.max_command_retries = 1;
        let rescheduler = QueueRescheduler::new();
        let mut invocation = TestInvocation::new(HostLog::new());

        let err = invocation
            .invoke(&mut InvocationContext::new("cfg"), &config, &rescheduler)
            .await
            .unwrap_err();

        assert!(err.is_device_not_available());
        assert_eq!(invocation.status(), InvocationStatus::Resumed);
        assert!(collector.ended_invocations().is_empty());
        assert!(collector.invocation_failures().is_empty());

        let resumed = rescheduler.take_scheduled();
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed[0].attempt, 1);
        assert_eq!(resumed[0].tests.len(), 1);
    }

    #[tokio::test]
    async fn test_device_loss_requests_retry_for_retriable_tests() {
        let collector = Arc::new(CollectingListener::new());
        let config = base_config(collector.clone(), build())
            .with_test(Arc::new(LosesDevice { resumable: false }));
        let rescheduler = QueueRescheduler::new();
        let mut invocation = TestInvocation::new(HostLog::new());

        let result = invocation
            .invoke(&mut InvocationContext::new("cfg"), &config, &rescheduler)
            .await;

        assert!(result.is_err());
        assert_eq!(invocation.status(), InvocationStatus::DeviceUnavailable);
        assert_eq!(rescheduler.take_retry_requests(), 1);
        assert_eq!(collector.invocation_failures().len(), 1);
        assert_eq!(collector.ended_invocations().len(), 1);
    }

    #[tokio::test]
    async fn test_last_teardown_error_is_returned() {
        let collector = Arc::new(CollectingListener::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut config = base_config(collector.clone(), build());
        for name in ["p1", "p2"] {
            config.devices[0].preparers.push(Box::new(Recorder {
                name: name.into(),
                log: log.clone(),
                fail_setup: false,
                fail_teardown: true,
            }));
        }
        let mut invocation = TestInvocation::new(HostLog::new());

        let err = invocation
            .invoke(&mut InvocationContext::new("cfg"), &config, &NoopRescheduler)
            .await
            .unwrap_err();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["setup p1", "setup p2", "teardown p2", "teardown p1"]
        );
        assert_eq!(err.to_string(), "Runtime error: teardown p1 failed");
        assert_eq!(invocation.status(), InvocationStatus::Failed);
        assert_eq!(collector.invocation_failures().len(), 1);
        assert_eq!(collector.ended_invocations().len(), 1);
    }

    #[tokio::test]
    async fn test_device_loss_disables_recovery() {
        let collector = Arc::new(CollectingListener::new());
        let stub = Arc::new(StubDevice::new("s1"));
        let device: DeviceHandle = stub.clone();
        let config = Configuration::new("cfg")
            .with_device(DeviceConfig::new("primary", device, build()))
            .with_listener(collector.clone())
            .with_test(Arc::new(LosesDevice { resumable: false }));
        let mut invocation = TestInvocation::new(HostLog::new());

        assert_eq!(stub.recovery_mode(), RecoveryMode::Available);
        let result = invocation
            .invoke(&mut InvocationContext::new("cfg"), &config, &NoopRescheduler)
            .await;

        assert!(result.is_err());
        assert_eq!(stub.recovery_mode(), RecoveryMode::None);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(InvocationStatus::Success.exit_code(), 0);
        assert_eq!(InvocationStatus::Failed.exit_code(), 1);
        assert_eq!(InvocationStatus::DeviceUnavailable.exit_code(), 2);
        assert_eq!(InvocationStatus::NoBuild.exit_code(), 4);
    }
}
