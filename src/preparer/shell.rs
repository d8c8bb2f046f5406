//! Preparers driven by shell commands.

use async_trait::async_trait;
use tracing::{debug, info};

use super::{MultiTargetPreparer, TargetPreparer};
use crate::build_info::BuildDescriptor;
use crate::context::InvocationContext;
use crate::device::{Command, DeviceHandle};
use crate::error::{HarnessError, HarnessResult};

/// Runs setup commands in order and teardown commands in order.
///
/// A non-zero exit during setup is a target setup error, or a build error
/// when the preparer validates the build itself. During teardown the
/// cause of the run is exported as `DEVRUN_TEARDOWN_CAUSE`.
#[derive(Debug, Clone)]
pub struct ShellPreparer {
    name: String,
    setup: Vec<Command>,
    teardown: Vec<Command>,
    build_check: bool,
}

impl ShellPreparer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            setup: Vec::new(),
            teardown: Vec::new(),
            build_check: false,
        }
    }

    pub fn setup_command(mut self, command: Command) -> Self {
        self.setup.push(command);
        self
    }

    pub fn teardown_command(mut self, command: Command) -> Self {
        self.teardown.push(command);
        self
    }

    /// Report setup failures as build errors.
    pub fn build_check(mut self, build_check: bool) -> Self {
        self.build_check = build_check;
        self
    }

    fn setup_error(&self, serial: &str, message: String) -> HarnessError {
        if self.build_check {
            HarnessError::build_error(serial, message)
        } else {
            HarnessError::target_setup(serial, message)
        }
    }
}

async fn run_checked(
    device: &DeviceHandle,
    command: &Command,
) -> HarnessResult<Result<(), String>> {
    let result = device.run_shell_command(command).await?;
    if result.success() {
        Ok(Ok(()))
    } else {
        Ok(Err(format!(
            "`{}` exited with {}: {}",
            command.to_shell_string(),
            result.exit_code,
            result.stderr.trim()
        )))
    }
}

fn with_context(command: &Command, build: &BuildDescriptor, cause: Option<&HarnessError>) -> Command {
    let mut command = command.clone().env("DEVRUN_BUILD_ID", &build.build_id);
    if let Some(cause) = cause {
        command = command.env("DEVRUN_TEARDOWN_CAUSE", cause.to_string());
    }
    command
}

#[async_trait]
impl TargetPreparer for ShellPreparer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn set_up(&self, device: &DeviceHandle, build: &BuildDescriptor) -> HarnessResult<()> {
        info!("[{}] setting up {}", device.serial(), self.name);
        for command in &self.setup {
            let command = with_context(command, build, None);
            if let Err(message) = run_checked(device, &command).await? {
                return Err(self.setup_error(device.serial(), message));
            }
        }
        Ok(())
    }

    fn supports_teardown(&self) -> bool {
        !self.teardown.is_empty()
    }

    async fn tear_down(
        &self,
        device: &DeviceHandle,
        build: &BuildDescriptor,
        cause: Option<&HarnessError>,
    ) -> HarnessResult<()> {
        debug!("[{}] tearing down {}", device.serial(), self.name);
        let mut first_error = None;
        for command in &self.teardown {
            let command = with_context(command, build, cause);
            match run_checked(device, &command).await {
                Ok(Ok(())) => {}
                Ok(Err(message)) => {
                    first_error.get_or_insert(HarnessError::Runtime(message));
                }
                Err(e) if e.is_device_not_available() => return Err(e),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn clone_box(&self) -> Box<dyn TargetPreparer> {
        Box::new(self.clone())
    }
}

/// Runs each of its commands on every device of the invocation.
#[derive(Debug, Clone)]
pub struct ShellMultiPreparer {
    name: String,
    setup: Vec<Command>,
    teardown: Vec<Command>,
}

impl ShellMultiPreparer {
    pub fn new(name: impl Into<String>, setup: Vec<Command>, teardown: Vec<Command>) -> Self {
        Self {
            name: name.into(),
            setup,
            teardown,
        }
    }
}

#[async_trait]
impl MultiTargetPreparer for ShellMultiPreparer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn set_up(&self, context: &InvocationContext) -> HarnessResult<()> {
        for (name, device) in context.named_devices() {
            let build = context.build_info(&name).cloned().unwrap_or_default();
            for command in &self.setup {
                let command = with_context(command, &build, None);
                if let Err(message) = run_checked(&device, &command).await? {
                    return Err(HarnessError::target_setup(device.serial(), message));
                }
            }
        }
        Ok(())
    }

    fn supports_teardown(&self) -> bool {
        !self.teardown.is_empty()
    }

    async fn tear_down(
        &self,
        context: &InvocationContext,
        cause: Option<&HarnessError>,
    ) -> HarnessResult<()> {
        for (name, device) in context.named_devices() {
            let build = context.build_info(&name).cloned().unwrap_or_default();
            for command in &self.teardown {
                let command = with_context(command, &build, cause);
                if let Err(message) = run_checked(&device, &command).await? {
                    return Err(HarnessError::Runtime(message));
                }
            }
        }
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn MultiTargetPreparer> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::device::local::LocalDevice;
    use crate::device::StubDevice;

    fn local_device(dir: &tempfile::TempDir) -> DeviceHandle {
        Arc::new(LocalDevice::new("local-0", dir.path().to_str()).unwrap())
    }

    #[tokio::test]
    async fn test_setup_failure_is_target_setup_error() {
        let dir = tempfile::tempdir().unwrap();
        let device = local_device(&dir);
        let preparer = ShellPreparer::new("install").setup_command(Command::new("false"));

        let err = preparer
            .set_up(&device, &BuildDescriptor::new("b1"))
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::TargetSetup { .. }));

        let checker = preparer.build_check(true);
        let err = checker
            .set_up(&device, &BuildDescriptor::new("b1"))
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::BuildError { .. }));
    }

    #[tokio::test]
    async fn test_teardown_sees_cause() {
        let dir = tempfile::tempdir().unwrap();
        let device = local_device(&dir);
        let preparer = ShellPreparer::new("cleanup").teardown_command(
            Command::new("sh")
                .arg("-c")
                .arg("echo \"$DEVRUN_TEARDOWN_CAUSE\" > cause.txt"),
        );
        assert!(preparer.supports_teardown());

        let cause = HarnessError::Runtime("boom".into());
        preparer
            .tear_down(&device, &BuildDescriptor::new("b1"), Some(&cause))
            .await
            .unwrap();
        let written = std::fs::read_to_string(dir.path().join("cause.txt")).unwrap();
        assert!(written.contains("boom"));
    }

    #[tokio::test]
    async fn test_clone_box_is_independent_copy() {
        let preparer: Box<dyn TargetPreparer> =
            Box::new(ShellPreparer::new("p").setup_command(Command::new("true")));
        let copy = preparer.clone();
        assert_eq!(copy.name(), "p");
        assert!(!copy.supports_teardown());

        let device: DeviceHandle = Arc::new(StubDevice::new("s1"));
        copy.set_up(&device, &BuildDescriptor::new("b")).await.unwrap();
    }

    #[tokio::test]
    async fn test_multi_preparer_runs_on_every_device() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let mut context = InvocationContext::new("cfg");
        context.add_device("a", local_device(&dir_a));
        context.add_device("b", local_device(&dir_b));

        let preparer = ShellMultiPreparer::new(
            "touch",
            vec![Command::new("touch").arg("ready")],
            Vec::new(),
        );
        preparer.set_up(&context).await.unwrap();
        assert!(dir_a.path().join("ready").exists());
        assert!(dir_b.path().join("ready").exists());
    }
}
