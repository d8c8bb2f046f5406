//! Target preparation.
//!
//! Preparers put a device into the state a test needs (install, flash,
//! push files) and optionally undo it afterwards. Preparers are stateful
//! and shared per module, so every module gets its own deep copy through
//! [`TargetPreparer::clone_box`].

pub mod shell;

use async_trait::async_trait;

use crate::build_info::BuildDescriptor;
use crate::context::InvocationContext;
use crate::device::DeviceHandle;
use crate::error::{HarnessError, HarnessResult};

pub use shell::{ShellMultiPreparer, ShellPreparer};

/// Prepares a single device for testing.
#[async_trait]
pub trait TargetPreparer: Send + Sync {
    fn name(&self) -> &str;

    /// Prepares `device` for testing `build`.
    ///
    /// # Errors
    ///
    /// [`HarnessError::TargetSetup`] or [`HarnessError::BuildError`] when
    /// preparation fails; the caller skips the remaining preparers and the
    /// tests. [`HarnessError::DeviceNotAvailable`] when the device is gone.
    async fn set_up(&self, device: &DeviceHandle, build: &BuildDescriptor) -> HarnessResult<()>;

    /// Returns `true` if [`tear_down`](Self::tear_down) should be called.
    fn supports_teardown(&self) -> bool {
        false
    }

    /// Undoes [`set_up`](Self::set_up).
    ///
    /// `cause` is the error that ended the run, if any.
    async fn tear_down(
        &self,
        _device: &DeviceHandle,
        _build: &BuildDescriptor,
        _cause: Option<&HarnessError>,
    ) -> HarnessResult<()> {
        Ok(())
    }

    /// Deep copy with independent state.
    fn clone_box(&self) -> Box<dyn TargetPreparer>;
}

impl Clone for Box<dyn TargetPreparer> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Prepares the whole set of devices of an invocation at once.
///
/// Runs after every per-device preparer and is torn down before them.
#[async_trait]
pub trait MultiTargetPreparer: Send + Sync {
    fn name(&self) -> &str;

    async fn set_up(&self, context: &InvocationContext) -> HarnessResult<()>;

    fn supports_teardown(&self) -> bool {
        false
    }

    async fn tear_down(
        &self,
        _context: &InvocationContext,
        _cause: Option<&HarnessError>,
    ) -> HarnessResult<()> {
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn MultiTargetPreparer>;
}

impl Clone for Box<dyn MultiTargetPreparer> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}
