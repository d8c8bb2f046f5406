//! Runtime configuration of one invocation.

use std::sync::Arc;
use std::time::Duration;

use crate::build_info::{BuildDescriptor, BuildProvider, StaticBuildProvider};
use crate::config::{
    BuildSection, Config, DeviceTarget, InvocationOptions, PreparerSection, TestSection,
};
use crate::device::local::LocalDevice;
use crate::device::{Command, DeviceHandle, StubDevice};
use crate::error::HarnessResult;
use crate::listener::{ResultForwarder, TestListener};
use crate::preparer::{MultiTargetPreparer, ShellMultiPreparer, ShellPreparer, TargetPreparer};
use crate::remote_test::{ShellCase, ShellTest, TestHandle};
use crate::suite::{ModuleConfig, TestSuite};

/// One device slot of a configuration.
#[derive(Clone)]
pub struct DeviceConfig {
    pub name: String,
    pub device: DeviceHandle,
    pub build_provider: Arc<dyn BuildProvider>,
    pub preparers: Vec<Box<dyn TargetPreparer>>,
}

impl DeviceConfig {
    pub fn new(
        name: impl Into<String>,
        device: DeviceHandle,
        build_provider: Arc<dyn BuildProvider>,
    ) -> Self {
        Self {
            name: name.into(),
            device,
            build_provider,
            preparers: Vec::new(),
        }
    }

    pub fn with_preparer(mut self, preparer: Box<dyn TargetPreparer>) -> Self {
        self.preparers.push(preparer);
        self
    }
}

/// Everything an invocation needs: devices, preparers, tests, listeners.
///
/// Cloning deep-copies preparers and shares devices, tests and listeners,
/// which is what shard and resume continuations need.
#[derive(Clone)]
pub struct Configuration {
    pub name: String,
    pub devices: Vec<DeviceConfig>,
    pub multi_preparers: Vec<Box<dyn MultiTargetPreparer>>,
    pub tests: Vec<TestHandle>,
    pub listeners: Vec<Arc<dyn TestListener>>,
    pub options: InvocationOptions,

    /// How many times this configuration has been resumed.
    pub attempt: u32,
}

impl Configuration {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            options: InvocationOptions {
                name: name.clone(),
                ..Default::default()
            },
            name,
            devices: Vec::new(),
            multi_preparers: Vec::new(),
            tests: Vec::new(),
            listeners: Vec::new(),
            attempt: 0,
        }
    }

    pub fn with_device(mut self, device: DeviceConfig) -> Self {
        self.devices.push(device);
        self
    }

    pub fn with_test(mut self, test: TestHandle) -> Self {
        self.tests.push(test);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn TestListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Fan-out over every configured listener.
    pub fn listener(&self) -> ResultForwarder {
        ResultForwarder::new(self.listeners.clone())
    }

    /// Builds a runtime configuration from a loaded config file, using the
    /// host-local devices, static build providers and shell preparers/tests.
    ///
    /// Listeners are not part of the file; add them afterwards.
    pub fn from_config(config: &Config) -> HarnessResult<Self> {
        let mut configuration = Configuration::new(&config.invocation.name);
        configuration.options = config.invocation.clone();

        for section in &config.devices {
            let device: DeviceHandle = match &section.target {
                DeviceTarget::Local(local) => {
                    let mut device = LocalDevice::new(&local.serial, local.working_dir.as_deref())?
                        .with_shell(&local.shell)
                        .with_env(local.env.clone())
                        .with_default_timeout(Duration::from_secs(local.command_timeout_secs));
                    if let Some(level) = local.battery_level {
                        device = device.with_battery_level(level);
                    }
                    Arc::new(device)
                }
                DeviceTarget::Stub(stub) => Arc::new(StubDevice::new(&stub.serial)),
            };
            let mut slot = DeviceConfig::new(&section.name, device, build_provider(section.build.as_ref()));
            for preparer in &section.preparers {
                slot = slot.with_preparer(shell_preparer(preparer)?);
            }
            configuration.devices.push(slot);
        }

        for section in &config.multi_preparers {
            configuration.multi_preparers.push(Box::new(ShellMultiPreparer::new(
                &section.name,
                parse_commands(&section.setup)?,
                parse_commands(&section.teardown)?,
            )));
        }

        if !config.modules.is_empty() {
            let mut modules = Vec::with_capacity(config.modules.len());
            for section in &config.modules {
                let mut module = ModuleConfig::new(
                    &section.name,
                    section
                        .tests
                        .iter()
                        .map(shell_test)
                        .collect::<HarnessResult<Vec<_>>>()?,
                )
                .not_shardable(section.not_shardable);
                for preparer in &section.preparers {
                    module = module.with_preparer(shell_preparer(preparer)?);
                }
                module.build_provider = section.build_provider.clone();
                module.result_reporters = section.result_reporters.clone();
                modules.push(module);
            }
            let suite = TestSuite::new(&config.invocation.name, modules)
                .dynamic(config.invocation.dynamic_modules)
                .bugreport_on_failure(config.invocation.bugreport_on_failure);
            configuration.tests.push(Arc::new(suite));
        }

        for section in &config.tests {
            configuration.tests.push(shell_test(section)?);
        }

        Ok(configuration)
    }
}

fn build_provider(section: Option<&BuildSection>) -> Arc<dyn BuildProvider> {
    match section {
        None => Arc::new(StaticBuildProvider::new(BuildDescriptor::new("local"))),
        Some(section) if !section.available => Arc::new(StaticBuildProvider::empty()),
        Some(section) => {
            let mut build = BuildDescriptor::new(&section.build_id);
            build.build_flavor = section.flavor.clone();
            build.branch = section.branch.clone();
            build.files = section.files.clone();
            build.attributes = section.attributes.clone();
            Arc::new(StaticBuildProvider::new(build))
        }
    }
}

fn parse_commands(lines: &[String]) -> HarnessResult<Vec<Command>> {
    lines.iter().map(|line| Command::parse(line)).collect()
}

fn shell_preparer(section: &PreparerSection) -> HarnessResult<Box<dyn TargetPreparer>> {
    let mut preparer = ShellPreparer::new(&section.name).build_check(section.build_check);
    for command in parse_commands(&section.setup)? {
        preparer = preparer.setup_command(command);
    }
    for command in parse_commands(&section.teardown)? {
        preparer = preparer.teardown_command(command);
    }
    Ok(Box::new(preparer))
}

fn shell_test(section: &TestSection) -> HarnessResult<TestHandle> {
    let cases = section
        .cases
        .iter()
        .map(|case| {
            let mut command = Command::parse(&case.command)?;
            if let Some(timeout) = case.timeout_secs {
                command = command.timeout(timeout);
            }
            Ok(ShellCase::new(&case.name, command))
        })
        .collect::<HarnessResult<Vec<_>>>()?;
    Ok(Arc::new(
        ShellTest::new(&section.name, cases)
            .resumable(section.resumable)
            .retriable(section.retriable),
    ))
}
