//! Configuration schema definitions for devrun.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. Device targets are selected through a tagged
//! enum, like any other pluggable collaborator.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── InvocationOptions      - Sharding, loop mode, collect-only, retries
//! ├── DeviceSection[]        - Allocated devices, in allocation order
//! │   ├── DeviceTarget       - Tagged enum selecting the device type
//! │   │   ├── Local          - The host, driven through a local shell
//! │   │   └── Stub           - Placeholder device
//! │   ├── BuildSection       - Build under test on this device
//! │   └── PreparerSection[]  - Per-device target preparers
//! ├── MultiPreparerSection[] - Preparers over every device at once
//! ├── ModuleSection[]        - Suite modules (tests + preparers)
//! ├── TestSection[]          - Standalone test units
//! └── ReportConfig           - Output and reporting settings
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration structure for devrun.
///
/// # Example
///
/// ```
/// use devrun::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [invocation]
///     name = "smoke"
///     shard_count = 2
///
///     [[devices]]
///     name = "primary"
///     [devices.target]
///     type = "stub"
///
///     [[modules]]
///     name = "basic"
///     [[modules.tests]]
///     name = "echo"
///     cases = [{ name = "hello", command = "echo hello" }]
/// "#).unwrap();
///
/// assert_eq!(config.invocation.shard_count, Some(2));
/// assert_eq!(config.modules[0].tests[0].cases.len(), 1);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub invocation: InvocationOptions,

    /// Devices allocated to the invocation, in allocation order.
    pub devices: Vec<DeviceSection>,

    #[serde(default)]
    pub multi_preparers: Vec<MultiPreparerSection>,

    /// Modules run as one suite, in order.
    #[serde(default)]
    pub modules: Vec<ModuleSection>,

    /// Test units run on their own after the suite.
    #[serde(default)]
    pub tests: Vec<TestSection>,

    #[serde(default)]
    pub report: ReportConfig,
}

/// Invocation-wide settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `name` | `"devrun"` |
/// | `shard_count` | None (no sharding) |
/// | `dynamic_modules` | false |
/// | `loop_mode` | false |
/// | `collect_only` | false |
/// | `test_tag` | `"stub"` |
/// | `bugreport_on_failure` | false |
/// | `max_command_retries` | 0 |
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct InvocationOptions {
    #[serde(default = "default_name")]
    pub name: String,

    /// Number of shards to split the invocation into.
    pub shard_count: Option<usize>,

    /// Index of this shard. Set on shard configurations only.
    pub shard_index: Option<usize>,

    /// Let shards pull units from shared pools instead of fixed buckets.
    #[serde(default)]
    pub dynamic_modules: bool,

    /// The command is rerun continuously; retries are never requested.
    #[serde(default)]
    pub loop_mode: bool,

    /// Report the tests without executing them.
    #[serde(default)]
    pub collect_only: bool,

    #[serde(default = "default_test_tag")]
    pub test_tag: String,

    /// Capture a bugreport every time a suite test fails.
    #[serde(default)]
    pub bugreport_on_failure: bool,

    /// How many times the CLI honors a retry request.
    #[serde(default)]
    pub max_command_retries: u32,
}

impl Default for InvocationOptions {
    fn default() -> Self {
        Self {
            name: default_name(),
            shard_count: None,
            shard_index: None,
            dynamic_modules: false,
            loop_mode: false,
            collect_only: false,
            test_tag: default_test_tag(),
            bugreport_on_failure: false,
            max_command_retries: 0,
        }
    }
}

fn default_name() -> String {
    "devrun".to_string()
}

fn default_test_tag() -> String {
    "stub".to_string()
}

/// One allocated device.
///
/// # Example
///
/// ```toml
/// [[devices]]
/// name = "host"
///
/// [devices.target]
/// type = "local"
/// serial = "local-0"
/// working_dir = "~/project"
///
/// [devices.build]
/// build_id = "1234"
/// branch = "main"
///
/// [[devices.preparers]]
/// name = "install"
/// setup = ["./install.sh"]
/// teardown = ["./uninstall.sh"]
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceSection {
    pub name: String,

    pub target: DeviceTarget,

    /// Build to test. When absent, a build with id `local` is used.
    pub build: Option<BuildSection>,

    #[serde(default)]
    pub preparers: Vec<PreparerSection>,
}

/// Device type selection.
///
/// | Type | Description |
/// |------|-------------|
/// | `local` | The host, commands run through a local shell |
/// | `stub` | Placeholder; commands succeed without running |
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DeviceTarget {
    Local(LocalTargetConfig),
    Stub(StubTargetConfig),
}

impl DeviceTarget {
    pub fn serial(&self) -> &str {
        match self {
            DeviceTarget::Local(c) => &c.serial,
            DeviceTarget::Stub(c) => &c.serial,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalTargetConfig {
    #[serde(default = "default_local_serial")]
    pub serial: String,

    /// Directory commands run in. `~` and environment variables expand.
    pub working_dir: Option<String>,

    #[serde(default = "default_shell")]
    pub shell: String,

    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Battery level the device reports.
    pub battery_level: Option<u32>,

    /// Timeout for commands without their own, in seconds.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn default_local_serial() -> String {
    "local-0".to_string()
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

fn default_command_timeout() -> u64 {
    900
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StubTargetConfig {
    #[serde(default = "default_stub_serial")]
    pub serial: String,
}

fn default_stub_serial() -> String {
    "stub-0".to_string()
}

/// Build offered by the static build provider.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BuildSection {
    pub build_id: String,

    pub flavor: Option<String>,

    pub branch: Option<String>,

    /// Artifact files that must exist when the build is fetched.
    #[serde(default)]
    pub files: BTreeMap<String, PathBuf>,

    #[serde(default)]
    pub attributes: BTreeMap<String, String>,

    /// When false, the provider reports no build available.
    #[serde(default = "default_true")]
    pub available: bool,
}

fn default_true() -> bool {
    true
}

/// A shell-command target preparer.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PreparerSection {
    pub name: String,

    /// Commands run in order during setup.
    #[serde(default)]
    pub setup: Vec<String>,

    /// Commands run in order during teardown.
    #[serde(default)]
    pub teardown: Vec<String>,

    /// Report setup failures as build errors instead of setup errors.
    #[serde(default)]
    pub build_check: bool,
}

/// A shell-command preparer run on every device.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MultiPreparerSection {
    pub name: String,

    #[serde(default)]
    pub setup: Vec<String>,

    #[serde(default)]
    pub teardown: Vec<String>,
}

/// A suite module.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModuleSection {
    pub name: String,

    /// Never split this module's units across shards.
    #[serde(default)]
    pub not_shardable: bool,

    #[serde(default)]
    pub preparers: Vec<PreparerSection>,

    #[serde(default)]
    pub tests: Vec<TestSection>,

    /// Must be unset for modules run in a suite.
    pub build_provider: Option<String>,

    /// Must be empty for modules run in a suite.
    #[serde(default)]
    pub result_reporters: Vec<String>,
}

/// A shell test unit.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TestSection {
    pub name: String,

    /// Skip already-run cases when the invocation resumes.
    #[serde(default)]
    pub resumable: bool,

    /// Ask for a fresh retry after a device loss.
    #[serde(default)]
    pub retriable: bool,

    #[serde(default)]
    pub cases: Vec<CaseSection>,
}

/// One shell test case.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaseSection {
    pub name: String,

    /// Shell-style command line.
    pub command: String,

    pub timeout_secs: Option<u64>,
}

/// Report configuration.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `output_dir` | `devrun-results` |
/// | `junit` | true |
/// | `junit_file` | `junit.xml` |
/// | `save_logs` | true |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    #[serde(default = "default_true")]
    pub junit: bool,

    #[serde(default = "default_junit_file")]
    pub junit_file: String,

    /// Write every `test_log` payload under `output_dir/logs`.
    #[serde(default = "default_true")]
    pub save_logs: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            junit: true,
            junit_file: default_junit_file(),
            save_logs: true,
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("devrun-results")
}

fn default_junit_file() -> String {
    "junit.xml".to_string()
}
