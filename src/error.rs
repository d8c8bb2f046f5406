//! Error taxonomy for invocation orchestration.
//!
//! Every fallible operation in the harness returns [`HarnessResult<T>`].
//! The variants of [`HarnessError`] map onto the failure categories the
//! orchestrator treats differently:
//!
//! | Variant | Severity | Handling |
//! |---------|----------|----------|
//! | `BuildUnavailable` | soft-fatal | reschedule the command, no crash |
//! | `BuildRetrieval` | fatal for the attempt | reported as invocation failure |
//! | `BuildError`, `TargetSetup` | preparation | abort setup, still tear down and report |
//! | `DeviceNotAvailable` | most severe recoverable | abort module/run, resume, rethrow after cleanup |
//! | `DeviceUnresponsive` | recovered | logged, execution continues |
//! | `Runtime` | contained per test unit | logged, next unit runs |

use serde::{Deserialize, Serialize};

/// Result type for harness operations.
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Errors raised while orchestrating an invocation.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// The build provider had no build to offer.
    #[error("No build available: {0}")]
    BuildUnavailable(String),

    /// The build provider failed while retrieving a build.
    #[error("Failed to retrieve build: {0}")]
    BuildRetrieval(String),

    /// The build itself is broken (flashing, installing, verifying).
    #[error("Build error on {}: {message}", .serial.as_deref().unwrap_or("unknown device"))]
    BuildError {
        serial: Option<String>,
        message: String,
    },

    /// A target preparer failed to set up the device.
    #[error("Target setup error on {}: {message}", .serial.as_deref().unwrap_or("unknown device"))]
    TargetSetup {
        serial: Option<String>,
        message: String,
    },

    /// The device disappeared and recovery could not bring it back.
    #[error("Device {serial} not available: {message}")]
    DeviceNotAvailable { serial: String, message: String },

    /// The device stopped responding but recovery succeeded.
    #[error("Device {serial} was unresponsive: {message}")]
    DeviceUnresponsive { serial: String, message: String },

    /// Unexpected failure inside a test unit or preparer.
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// The configuration is invalid or cannot run in this context.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// I/O error while reading or writing artifacts.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HarnessError {
    /// Creates a [`HarnessError::TargetSetup`] for the given device.
    pub fn target_setup(serial: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TargetSetup {
            serial: Some(serial.into()),
            message: message.into(),
        }
    }

    /// Creates a [`HarnessError::BuildError`] for the given device.
    pub fn build_error(serial: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BuildError {
            serial: Some(serial.into()),
            message: message.into(),
        }
    }

    /// Creates a [`HarnessError::DeviceNotAvailable`].
    pub fn device_not_available(serial: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DeviceNotAvailable {
            serial: serial.into(),
            message: message.into(),
        }
    }

    /// Returns `true` for errors raised while preparing a target.
    pub fn is_preparation_error(&self) -> bool {
        matches!(self, Self::BuildError { .. } | Self::TargetSetup { .. })
    }

    /// Returns `true` if the device is gone for the rest of this attempt.
    pub fn is_device_not_available(&self) -> bool {
        matches!(self, Self::DeviceNotAvailable { .. })
    }

    /// Serial of the device that caused the failure, when known.
    pub fn device_serial(&self) -> Option<&str> {
        match self {
            Self::BuildError { serial, .. } | Self::TargetSetup { serial, .. } => serial.as_deref(),
            Self::DeviceNotAvailable { serial, .. } | Self::DeviceUnresponsive { serial, .. } => {
                Some(serial)
            }
            _ => None,
        }
    }

    /// Bugreport category to capture for this failure, if any.
    pub fn bugreport_category(&self) -> Option<BugreportCategory> {
        match self {
            Self::BuildError { .. } => Some(BugreportCategory::BuildError),
            Self::TargetSetup { .. } => Some(BugreportCategory::TargetSetupError),
            Self::DeviceNotAvailable { .. } => Some(BugreportCategory::DeviceUnresponsive),
            _ => None,
        }
    }

    /// Coarse category used when describing the failure to listeners.
    pub fn failure_category(&self) -> FailureCategory {
        match self {
            Self::BuildUnavailable(_) | Self::BuildRetrieval(_) | Self::BuildError { .. } => {
                FailureCategory::Build
            }
            Self::TargetSetup { .. } => FailureCategory::TargetSetup,
            Self::DeviceNotAvailable { .. } | Self::DeviceUnresponsive { .. } => {
                FailureCategory::Device
            }
            Self::Config(_) => FailureCategory::Config,
            Self::Runtime(_) | Self::Io(_) | Self::Other(_) => FailureCategory::Infra,
        }
    }
}

/// Name under which a failure bugreport is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BugreportCategory {
    BuildError,
    TargetSetupError,
    DeviceUnresponsive,
}

impl BugreportCategory {
    /// Log name prefix for bugreports of this category.
    pub fn as_str(&self) -> &'static str {
        match self {
            BugreportCategory::BuildError => "build_error_bugreport",
            BugreportCategory::TargetSetupError => "target_setup_error_bugreport",
            BugreportCategory::DeviceUnresponsive => "device_unresponsive_bugreport",
        }
    }
}

/// Broad failure category carried by a [`FailureDescription`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Build,
    TargetSetup,
    Device,
    Config,
    Infra,
}

/// Owned, cloneable description of an invocation failure.
///
/// [`HarnessError`] holds non-cloneable sources, so listeners receive this
/// instead. It can be buffered by shard listeners and serialized into
/// reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDescription {
    pub message: String,
    pub category: FailureCategory,
}

impl FailureDescription {
    pub fn new(message: impl Into<String>, category: FailureCategory) -> Self {
        Self {
            message: message.into(),
            category,
        }
    }
}

impl From<&HarnessError> for FailureDescription {
    fn from(err: &HarnessError) -> Self {
        Self::new(err.to_string(), err.failure_category())
    }
}

impl std::fmt::Display for FailureDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preparation_classification() {
        assert!(HarnessError::target_setup("dev-1", "flash failed").is_preparation_error());
        assert!(HarnessError::build_error("dev-1", "bad image").is_preparation_error());
        assert!(!HarnessError::device_not_available("dev-1", "gone").is_preparation_error());
        assert!(!HarnessError::Runtime("boom".into()).is_preparation_error());
    }

    #[test]
    fn test_bugreport_category() {
        assert_eq!(
            HarnessError::build_error("d", "x").bugreport_category(),
            Some(BugreportCategory::BuildError)
        );
        assert_eq!(
            HarnessError::target_setup("d", "x").bugreport_category(),
            Some(BugreportCategory::TargetSetupError)
        );
        assert_eq!(
            HarnessError::device_not_available("d", "x").bugreport_category(),
            Some(BugreportCategory::DeviceUnresponsive)
        );
        assert_eq!(HarnessError::Runtime("x".into()).bugreport_category(), None);
    }

    #[test]
    fn test_device_serial_and_display() {
        let err = HarnessError::TargetSetup {
            serial: None,
            message: "no space".into(),
        };
        assert_eq!(err.device_serial(), None);
        assert_eq!(err.to_string(), "Target setup error on unknown device: no space");

        let err = HarnessError::device_not_available("emu-5554", "adb offline");
        assert_eq!(err.device_serial(), Some("emu-5554"));
        let description = FailureDescription::from(&err);
        assert_eq!(description.category, FailureCategory::Device);
        assert!(description.message.contains("emu-5554"));
    }
}
