//! Device abstraction consumed by the orchestrator.
//!
//! The orchestrator never talks to hardware directly. Everything it needs
//! from a target (shell execution, log capture, reboots, recovery policy)
//! goes through the narrow [`Device`] trait.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Device                              │
//! │                                                              │
//! │  run_shell_command(Command) ──► ExecResult                  │
//! │  fetch_log_stream() / clear_log()                           │
//! │  reboot()                                                    │
//! │  set_recovery_mode(mode)                                    │
//! │  take_bugreport()                                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Built-in Devices
//!
//! | Device | Module | Description |
//! |--------|--------|-------------|
//! | Stub | [`StubDevice`] | Placeholder with no backing target |
//! | Local | [`local`] | The host itself, driven through a local shell |

pub mod local;

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, HarnessResult};
use crate::result::LogStream;

/// Shared handle to an allocated device.
pub type DeviceHandle = Arc<dyn Device>;

/// How hard the device layer should try to recover an unresponsive device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMode {
    /// Never attempt recovery.
    None,
    /// Only wait for the device to come back online.
    OnlineOnly,
    /// Full recovery until the device is available again.
    #[default]
    Available,
}

/// A command to execute on a device.
///
/// # Example
///
/// ```
/// use devrun::device::Command;
///
/// let cmd = Command::new("pm")
///     .arg("install")
///     .arg("-r")
///     .args(["/data/local/tmp/app.apk"])
///     .env("LOG_TAG", "devrun")
///     .timeout(120);
///
/// assert_eq!(cmd.program, "pm");
/// assert_eq!(cmd.args.len(), 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// The program/executable to run.
    pub program: String,

    /// Arguments to pass to the program.
    pub args: Vec<String>,

    /// Environment variables to set for this command.
    pub env: Vec<(String, String)>,

    /// Maximum execution time in seconds.
    pub timeout_secs: Option<u64>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            timeout_secs: None,
        }
    }

    /// Parses a shell-style command line into program and arguments.
    ///
    /// ```
    /// use devrun::device::Command;
    ///
    /// let cmd = Command::parse("echo 'hello world'").unwrap();
    /// assert_eq!(cmd.program, "echo");
    /// assert_eq!(cmd.args, vec!["hello world"]);
    /// ```
    pub fn parse(line: &str) -> HarnessResult<Self> {
        let mut words = shell_words::split(line)
            .map_err(|e| HarnessError::Config(format!("Invalid command `{}`: {}", line, e)))?
            .into_iter();
        let program = words
            .next()
            .ok_or_else(|| HarnessError::Config("Empty command".to_string()))?;
        Ok(Self::new(program).args(words))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Converts the command to a shell-executable string.
    ///
    /// ```
    /// use devrun::device::Command;
    /// let cmd = Command::new("echo").arg("hello world");
    /// assert_eq!(cmd.to_shell_string(), "echo 'hello world'");
    /// ```
    pub fn to_shell_string(&self) -> String {
        let mut parts = vec![shell_escape(&self.program)];
        for arg in &self.args {
            parts.push(shell_escape(arg));
        }
        parts.join(" ")
    }
}

/// Result of executing a command on a device.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: std::time::Duration,
}

impl ExecResult {
    /// Returns `true` if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A target the harness runs tests against.
///
/// Implementations must be shareable across tasks: the same handle is held
/// by the invocation context, by every module running on it, and by the
/// tests those modules execute.
///
/// # Errors
///
/// Any operation may fail with [`HarnessError::DeviceNotAvailable`] once
/// the device is gone, or [`HarnessError::DeviceUnresponsive`] when it
/// stopped responding but recovery brought it back.
#[async_trait]
pub trait Device: Send + Sync {
    /// Serial number identifying the device.
    fn serial(&self) -> &str;

    /// Returns `true` for placeholder devices with no real target.
    ///
    /// Log and bugreport collection is skipped for stub devices.
    fn is_stub(&self) -> bool {
        false
    }

    /// Runs a command on the device and waits for it to finish.
    async fn run_shell_command(&self, cmd: &Command) -> HarnessResult<ExecResult>;

    /// Returns the device log captured since the last [`clear_log`](Self::clear_log).
    async fn fetch_log_stream(&self) -> HarnessResult<LogStream>;

    /// Discards the captured device log.
    async fn clear_log(&self) -> HarnessResult<()>;

    /// Reboots the device and waits until it is available again.
    async fn reboot(&self) -> HarnessResult<()>;

    /// Sets the recovery policy for the device.
    fn set_recovery_mode(&self, mode: RecoveryMode);

    /// Current recovery policy.
    fn recovery_mode(&self) -> RecoveryMode;

    /// Battery level in percent, when the device reports one.
    async fn battery_level(&self) -> Option<u32> {
        None
    }

    /// Captures a bugreport, or `None` if the device cannot produce one.
    async fn take_bugreport(&self) -> HarnessResult<Option<LogStream>> {
        Ok(None)
    }
}

/// Placeholder device with no backing target.
///
/// Commands succeed without doing anything, and the device log is always
/// empty.
pub struct StubDevice {
    serial: String,
    recovery_mode: Mutex<RecoveryMode>,
}

impl StubDevice {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            recovery_mode: Mutex::new(RecoveryMode::default()),
        }
    }
}

#[async_trait]
impl Device for StubDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn is_stub(&self) -> bool {
        true
    }

    async fn run_shell_command(&self, _cmd: &Command) -> HarnessResult<ExecResult> {
        Ok(ExecResult {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration: std::time::Duration::ZERO,
        })
    }

    async fn fetch_log_stream(&self) -> HarnessResult<LogStream> {
        Ok(LogStream::default())
    }

    async fn clear_log(&self) -> HarnessResult<()> {
        Ok(())
    }

    async fn reboot(&self) -> HarnessResult<()> {
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
}

/// Escape a string for use in a shell command.
fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.' || c == '/')
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}
