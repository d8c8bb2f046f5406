//! Configuration loading and validation for devrun.
//!
//! This module provides functions for loading devrun configuration from
//! TOML files or strings and checking it before anything is allocated.
//!
//! # The Configuration File Format is described in the README.

pub mod schema;

pub use schema::*;

use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use regex::Regex;

use crate::device::Command;

static NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$").expect("name pattern is valid")
});

/// Loads devrun configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use devrun::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("devrun.toml"))?;
/// println!("Devices: {}", config.devices.len());
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads devrun configuration from a TOML string.
///
/// # Example
///
/// ```
/// use devrun::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [[devices]]
///     name = "primary"
///     [devices.target]
///     type = "stub"
/// "#)?;
///
/// assert_eq!(config.invocation.name, "devrun");
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

/// Checks a loaded configuration for errors the schema cannot express.
///
/// # Errors
///
/// Returns an error if:
/// - No device is configured, or two devices share a name
/// - A device, module or test name is not a plain identifier
/// - `shard_count` is zero
/// - A command line cannot be parsed
pub fn validate_config(config: &Config) -> Result<()> {
    if config.devices.is_empty() {
        bail!("At least one [[devices]] entry is required");
    }

    let mut names = HashSet::new();
    for device in &config.devices {
        check_name("device", &device.name)?;
        if !names.insert(device.name.as_str()) {
            bail!("Duplicate device name `{}`", device.name);
        }
        for preparer in &device.preparers {
            check_preparer(preparer)
                .with_context(|| format!("In device `{}`", device.name))?;
        }
    }

    if config.invocation.shard_count == Some(0) {
        bail!("shard_count must be at least 1");
    }

    for preparer in &config.multi_preparers {
        check_name("preparer", &preparer.name)?;
        check_commands(preparer.setup.iter().chain(&preparer.teardown))
            .with_context(|| format!("In multi preparer `{}`", preparer.name))?;
    }

    for module in &config.modules {
        check_name("module", &module.name)?;
        for preparer in &module.preparers {
            check_preparer(preparer).with_context(|| format!("In module `{}`", module.name))?;
        }
        for test in &module.tests {
            check_test(test).with_context(|| format!("In module `{}`", module.name))?;
        }
    }

    for test in &config.tests {
        check_test(test)?;
    }

    Ok(())
}

fn check_name(kind: &str, name: &str) -> Result<()> {
    if !NAME_PATTERN.is_match(name) {
        bail!(
            "Invalid {} name `{}`: use letters, digits, `_`, `.` and `-`",
            kind,
            name
        );
    }
    Ok(())
}

fn check_preparer(preparer: &PreparerSection) -> Result<()> {
    check_name("preparer", &preparer.name)?;
    check_commands(preparer.setup.iter().chain(&preparer.teardown))
        .with_context(|| format!("In preparer `{}`", preparer.name))
}

fn check_test(test: &TestSection) -> Result<()> {
    check_name("test", &test.name)?;
    if test.cases.is_empty() {
        bail!("Test `{}` has no cases", test.name);
    }
    check_commands(test.cases.iter().map(|c| &c.command))
        .with_context(|| format!("In test `{}`", test.name))
}

fn check_commands<'a>(commands: impl IntoIterator<Item = &'a String>) -> Result<()> {
    for command in commands {
        Command::parse(command)?;
    }
    Ok(())
}
