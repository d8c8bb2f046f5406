//! Suite execution.
//!
//! A [`TestSuite`] is a test unit made of module configurations. When it
//! runs, it turns its configurations into [`ModuleDefinition`]s and runs
//! them in order against the injected device. When the invocation is
//! sharded, the suite splits into one suite per shard, each carrying its
//! share of already-built modules.
//!
//! # Module Organization
//!
//! - [`pool`] - shared pool of pending units
//! - [`module`] - module lifecycle and result aggregation
//! - [`splitter`] - configuration to module partitioning

pub mod module;
pub mod pool;
pub mod splitter;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::context::InvocationContext;
use crate::device::DeviceHandle;
use crate::error::HarnessResult;
use crate::listener::TestListener;
use crate::remote_test::{RemoteTest, TestCapabilities, TestHandle, TestInformation};
use crate::result::{LogDataType, TestDescription};
use crate::scheduler::Scheduler;

pub use module::{ModuleDefinition, ModuleState, PREPARATION_ERROR_TEST};
pub use pool::TestPool;
pub use splitter::{ModuleConfig, split_configuration};

/// A test unit that runs a list of modules.
pub struct TestSuite {
    name: String,
    configs: Vec<ModuleConfig>,
    dynamic: bool,
    bugreport_on_failure: bool,
    prepared: Mutex<Option<Vec<ModuleDefinition>>>,
}

impl TestSuite {
    pub fn new(name: impl Into<String>, configs: Vec<ModuleConfig>) -> Self {
        Self {
            name: name.into(),
            configs,
            dynamic: false,
            bugreport_on_failure: false,
            prepared: Mutex::new(None),
        }
    }

    /// Share units between shards through pools instead of fixed buckets.
    pub fn dynamic(mut self, dynamic: bool) -> Self {
        self.dynamic = dynamic;
        self
    }

    /// Capture a device bugreport whenever a test fails.
    pub fn bugreport_on_failure(mut self, enabled: bool) -> Self {
        self.bugreport_on_failure = enabled;
        self
    }

    /// A suite running exactly `modules`, as produced by a split.
    fn from_modules(&self, modules: Vec<ModuleDefinition>) -> Self {
        Self {
            name: self.name.clone(),
            configs: Vec::new(),
            dynamic: self.dynamic,
            bugreport_on_failure: self.bugreport_on_failure,
            prepared: Mutex::new(Some(modules)),
        }
    }

    pub fn configs(&self) -> &[ModuleConfig] {
        &self.configs
    }

    fn take_modules(&self) -> HarnessResult<Vec<ModuleDefinition>> {
        let prepared = self
            .prepared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match prepared {
            Some(modules) => Ok(modules),
            None => split_configuration(&self.configs, None, self.dynamic),
        }
    }
}

#[async_trait]
impl RemoteTest for TestSuite {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> TestCapabilities {
        TestCapabilities {
            device_bound: true,
            build_bound: true,
            resumable: false,
            retriable: self
                .configs
                .iter()
                .flat_map(|c| &c.tests)
                .any(|t| t.capabilities().retriable),
            collector: true,
        }
    }

    async fn run(
        &self,
        info: &TestInformation<'_>,
        listener: &dyn TestListener,
    ) -> HarnessResult<()> {
        let mut modules = self.take_modules()?;
        info!("Suite {}: running {} modules", self.name, modules.len());

        let failure_capture = FailureBugreporter {
            device: info.device.clone().filter(|_| self.bugreport_on_failure),
            main: listener,
            taken: AtomicUsize::new(0),
        };

        for module in &mut modules {
            module.set_device(info.device.clone());
            module.set_build(info.build.clone());
            module.set_collect_only(info.collect_only);

            let mut module_context = InvocationContext::new(module.id());
            module_context.set_test_tag(info.context.test_tag());
            for (name, device) in info.context.named_devices() {
                module_context.add_device(name, device);
            }
            for (name, build) in info.context.named_build_infos() {
                module_context.add_build_info(name, build);
            }

            listener.test_module_started(&module_context).await;
            let mut scoped = info.context.clone();
            scoped.set_module_context(module_context);
            let result = module
                .run(&scoped, listener, Some(&failure_capture))
                .await;
            listener.test_module_ended().await;
            result?;
        }
        Ok(())
    }

    fn split(&self, shard_count_hint: usize) -> HarnessResult<Option<Vec<TestHandle>>> {
        if shard_count_hint <= 1 {
            return Ok(None);
        }
        let modules = split_configuration(&self.configs, Some(shard_count_hint), self.dynamic)?;
        if modules.len() <= 1 {
            return Ok(None);
        }
        let shards = Scheduler::new(shard_count_hint)
            .schedule(modules)
            .into_iter()
            .map(|bucket| Arc::new(self.from_modules(bucket)) as TestHandle)
            .collect();
        Ok(Some(shards))
    }
}

/// Failure listener that captures a bugreport for every failed test.
struct FailureBugreporter<'a> {
    device: Option<DeviceHandle>,
    main: &'a dyn TestListener,
    taken: AtomicUsize,
}

#[async_trait]
impl TestListener for FailureBugreporter<'_> {
    async fn test_failed(&self, test: &TestDescription, _trace: &str) {
        let Some(device) = &self.device else {
            return;
        };
        if device.is_stub() {
            return;
        }
        match device.take_bugreport().await {
            Ok(Some(report)) => {
                let index = self.taken.fetch_add(1, Ordering::Relaxed);
                let name = format!("{}-failure-bugreport-{}", test, index);
                self.main.test_log(&name, LogDataType::Bugreport, &report).await;
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to capture bugreport for {}: {}", test, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_info::BuildDescriptor;
    use crate::device::local::LocalDevice;
    use crate::device::{Command, StubDevice};
    use crate::listener::{CollectingListener, InvocationEvent};
    use crate::remote_test::{ShellCase, ShellTest};

    fn unit(name: &str, command: &str) -> TestHandle {
        Arc::new(ShellTest::new(
            name,
            vec![ShellCase::new("case", Command::new(command))],
        ))
    }

    #[tokio::test]
    async fn test_runs_modules_in_order() {
        let suite = TestSuite::new(
            "suite",
            vec![
                ModuleConfig::new("first", vec![unit("a", "true")]),
                ModuleConfig::new("second", vec![unit("b", "true")]),
            ],
        );
        let mut context = InvocationContext::new("cfg");
        let device: DeviceHandle = Arc::new(StubDevice::new("s1"));
        context.add_device("primary", device.clone());
        let info = TestInformation::inject(
            &context,
            suite.capabilities(),
            Some(&device),
            Some(&BuildDescriptor::new("b1")),
            false,
        );
        let listener = CollectingListener::new();

        suite.run(&info, &listener).await.unwrap();

        let names: Vec<String> = listener.runs().iter().map(|r| r.name().to_string()).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert_eq!(
            listener.count(|e| matches!(e, InvocationEvent::ModuleStarted(_))),
            2
        );
        assert_eq!(listener.count(|e| matches!(e, InvocationEvent::ModuleEnded)), 2);
    }

    /// Unit that records the module context it runs under.
    struct SeesModule {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl RemoteTest for SeesModule {
        fn name(&self) -> &str {
            "sees-module"
        }

        fn capabilities(&self) -> TestCapabilities {
            TestCapabilities::default()
        }

        async fn run(
            &self,
            info: &TestInformation<'_>,
            _listener: &dyn TestListener,
        ) -> HarnessResult<()> {
            let module = info.context.module_context().map(|c| c.config_name().to_string());
            self.seen.lock().unwrap().push(module.unwrap_or_default());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_units_run_under_their_module_context() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let suite = TestSuite::new(
            "suite",
            vec![
                ModuleConfig::new("first", vec![Arc::new(SeesModule { seen: seen.clone() }) as TestHandle]),
                ModuleConfig::new("second", vec![Arc::new(SeesModule { seen: seen.clone() }) as TestHandle]),
            ],
        );
        let context = InvocationContext::new("cfg");
        let info = TestInformation::inject(&context, suite.capabilities(), None, None, false);

        suite.run(&info, &CollectingListener::new()).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
        assert!(context.module_context().is_none());
    }

    #[test]
    fn test_split_buckets_modules_per_shard() {
        let suite = TestSuite::new(
            "suite",
            vec![
                ModuleConfig::new("m", (0..4).map(|i| unit(&format!("u{}", i), "true")).collect())
                    .not_shardable(true),
            ],
        );
        let shards = suite.split(2).unwrap().unwrap();
        assert_eq!(shards.len(), 2);
        assert!(suite.split(1).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bugreport_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let device: DeviceHandle =
            Arc::new(LocalDevice::new("local-0", dir.path().to_str()).unwrap());
        let suite = TestSuite::new("suite", vec![ModuleConfig::new("m", vec![unit("u", "false")])])
            .bugreport_on_failure(true);
        let context = InvocationContext::new("cfg");
        let info =
            TestInformation::inject(&context, suite.capabilities(), Some(&device), None, false);
        let listener = CollectingListener::new();

        suite.run(&info, &listener).await.unwrap();

        assert_eq!(listener.log_names(), vec!["u#case-failure-bugreport-0"]);
    }
}
