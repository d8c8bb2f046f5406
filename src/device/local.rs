//! Host-local device implementation.
//!
//! A [`LocalDevice`] treats the host itself as the target: commands run as
//! child processes of the harness, and the "device log" is the transcript
//! of every command executed since the log was last cleared.
//!
//! # When to Use
//!
//! - **Development**: iterate on configurations without real hardware
//! - **Host-side suites**: tests that only need a shell on the runner
//!
//! # Example Configuration
//!
//! ```toml
//! [[devices]]
//! name = "host"
//! serial = "local-0"
//! working_dir = "~/project"
//! shell = "/bin/bash"
//!
//! [devices.env]
//! RUST_LOG = "debug"
//! ```

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use super::{Command, Device, ExecResult, RecoveryMode};
use crate::error::{HarnessError, HarnessResult};
use crate::result::LogStream;

/// A device backed by the local host shell.
pub struct LocalDevice {
    serial: String,
    working_dir: PathBuf,
    shell: String,
    env: Vec<(String, String)>,
    battery_level: Option<u32>,
    default_timeout: Duration,
    log: Mutex<Vec<u8>>,
    recovery_mode: Mutex<RecoveryMode>,
}

impl LocalDevice {
    /// Creates a local device rooted at `working_dir`.
    ///
    /// `~` and environment variables in the path are expanded.
    pub fn new(serial: impl Into<String>, working_dir: Option<&str>) -> HarnessResult<Self> {
        let working_dir = match working_dir {
            Some(dir) => PathBuf::from(
                shellexpand::full(dir)
                    .map_err(|e| HarnessError::Config(format!("Invalid working_dir: {}", e)))?
                    .into_owned(),
            ),
            None => std::env::current_dir()?,
        };
        Ok(Self {
            serial: serial.into(),
            working_dir,
            shell: "/bin/sh".to_string(),
            env: Vec::new(),
            battery_level: None,
            default_timeout: Duration::from_secs(900),
            log: Mutex::new(Vec::new()),
            recovery_mode: Mutex::new(RecoveryMode::default()),
        })
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_env(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(env);
        self
    }

    /// Battery level this device reports.
    pub fn with_battery_level(mut self, level: u32) -> Self {
        self.battery_level = Some(level);
        self
    }

    /// Timeout applied to commands that do not set their own.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    fn append_log(&self, text: &str) {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        log.extend_from_slice(text.as_bytes());
        if !text.ends_with('\n') {
            log.push(b'\n');
        }
    }
}

#[async_trait]
impl Device for LocalDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    async fn run_shell_command(&self, cmd: &Command) -> HarnessResult<ExecResult> {
        if !self.working_dir.is_dir() {
            return Err(HarnessError::device_not_available(
                &self.serial,
                format!("working directory {} is gone", self.working_dir.display()),
            ));
        }

        let shell_cmd = cmd.to_shell_string();
        debug!("[{}] $ {}", self.serial, shell_cmd);

        let mut process = tokio::process::Command::new(&self.shell);
        process.arg("-c").arg(&shell_cmd);
        process.current_dir(&self.working_dir);
        for (key, value) in self.env.iter().chain(cmd.env.iter()) {
            process.env(key, value);
        }
        process.stdout(Stdio::piped()).stderr(Stdio::piped());
        process.kill_on_drop(true);

        let timeout = cmd
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);
        let start = Instant::now();
        let output = match tokio::time::timeout(timeout, process.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(HarnessError::device_not_available(
                    &self.serial,
                    format!("failed to spawn `{}`: {}", self.shell, e),
                ));
            }
            Err(_) => {
                self.append_log(&format!("$ {}\n<timed out after {:?}>", shell_cmd, timeout));
                return Err(HarnessError::DeviceUnresponsive {
                    serial: self.serial.clone(),
                    message: format!("`{}` timed out after {:?}", shell_cmd, timeout),
                });
            }
        };

        let result = ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: start.elapsed(),
        };
        self.append_log(&format!(
            "$ {}\n{}{}<exit {}>",
            shell_cmd, result.stdout, result.stderr, result.exit_code
        ));
        Ok(result)
    }

    async fn fetch_log_stream(&self) -> HarnessResult<LogStream> {
        let log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(LogStream::from_bytes(log.clone()))
    }

    async fn clear_log(&self) -> HarnessResult<()> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }

    async fn reboot(&self) -> HarnessResult<()> {
        self.clear_log().await?;
        self.append_log(&format!("--- {} rebooted ---", self.serial));
        Ok(())
    }

    fn set_recovery_mode(&self, mode: RecoveryMode) {
        *self
            .recovery_mode
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = mode;
    }

    fn recovery_mode(&self) -> RecoveryMode {
        *self
            .recovery_mode
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn battery_level(&self) -> Option<u32> {
        self.battery_level
    }

    async fn take_bugreport(&self) -> HarnessResult<Option<LogStream>> {
        let log = self.fetch_log_stream().await?;
        let mut report = format!(
            "== bugreport {} at {} ==\nworking_dir: {}\nrecovery_mode: {:?}\n\n",
            self.serial,
            chrono::Utc::now().to_rfc3339(),
            self.working_dir.display(),
            self.recovery_mode()
        )
        .into_bytes();
        report.extend_from_slice(log.as_bytes());
        Ok(Some(LogStream::from_bytes(report)))
    }
}
