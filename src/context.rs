//! Per-invocation bookkeeping.
//!
//! An [`InvocationContext`] records which devices were allocated to an
//! invocation, which build each device is testing, and free-form
//! attributes collected along the way. It is created once per invocation
//! attempt, mutated by the driving task only, and cloned when an attempt
//! is handed to a shard or a resumed continuation.

use crate::build_info::BuildDescriptor;
use crate::device::{DeviceHandle, RecoveryMode};

/// Mutable state shared by every component of one invocation attempt.
///
/// Devices and builds are kept in device-allocation order. Attributes are
/// multi-valued: every value added under a key is retained, in insertion
/// order, duplicates included.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use devrun::context::InvocationContext;
/// use devrun::device::{DeviceHandle, StubDevice};
///
/// let mut context = InvocationContext::new("smoke");
/// let device: DeviceHandle = Arc::new(StubDevice::new("emu-5554"));
/// context.add_device("primary", device);
/// context.add_attribute("primary-battery-initial", "87");
///
/// assert_eq!(context.device_names(), vec!["primary"]);
/// assert!(context.device_by_serial("emu-5554").is_some());
/// assert!(context.device_by_serial("missing").is_none());
/// ```
#[derive(Clone)]
pub struct InvocationContext {
    invocation_id: String,
    config_name: String,
    devices: Vec<(String, DeviceHandle)>,
    builds: Vec<(String, BuildDescriptor)>,
    attributes: Vec<(String, Vec<String>)>,
    test_tag: String,
    module_context: Option<Box<InvocationContext>>,
}

impl InvocationContext {
    /// Creates an empty context for the named configuration.
    pub fn new(config_name: impl Into<String>) -> Self {
        Self {
            invocation_id: uuid::Uuid::new_v4().to_string(),
            config_name: config_name.into(),
            devices: Vec::new(),
            builds: Vec::new(),
            attributes: Vec::new(),
            test_tag: String::from("stub"),
            module_context: None,
        }
    }

    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    pub fn config_name(&self) -> &str {
        &self.config_name
    }

    pub fn test_tag(&self) -> &str {
        &self.test_tag
    }

    pub fn set_test_tag(&mut self, tag: impl Into<String>) {
        self.test_tag = tag.into();
    }

    /// Tracks `device` under `name`.
    ///
    /// Re-adding an existing name replaces the device handle in place and
    /// keeps any build already attached to that name.
    pub fn add_device(&mut self, name: impl Into<String>, device: DeviceHandle) {
        let name = name.into();
        match self.devices.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = device,
            None => self.devices.push((name, device)),
        }
    }

    /// Attaches `build` to the device tracked under `name`.
    pub fn add_build_info(&mut self, name: impl Into<String>, build: BuildDescriptor) {
        let name = name.into();
        match self.builds.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = build,
            None => self.builds.push((name, build)),
        }
    }

    /// Device names in allocation order.
    pub fn device_names(&self) -> Vec<&str> {
        self.devices.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Snapshot of the tracked devices in allocation order.
    pub fn devices(&self) -> Vec<DeviceHandle> {
        self.devices.iter().map(|(_, d)| d.clone()).collect()
    }

    /// Snapshot of `(name, device)` pairs in allocation order.
    pub fn named_devices(&self) -> Vec<(String, DeviceHandle)> {
        self.devices.clone()
    }

    /// Snapshot of the attached builds, ordered by device allocation.
    ///
    /// Builds attached under a name with no device come last, in the order
    /// they were added.
    pub fn build_infos(&self) -> Vec<BuildDescriptor> {
        self.named_build_infos().into_iter().map(|(_, b)| b).collect()
    }

    /// Snapshot of `(name, build)` pairs, ordered by device allocation.
    pub fn named_build_infos(&self) -> Vec<(String, BuildDescriptor)> {
        let mut ordered: Vec<(String, BuildDescriptor)> = self
            .devices
            .iter()
            .filter_map(|(name, _)| {
                self.builds
                    .iter()
                    .find(|(n, _)| n == name)
                    .map(|(n, b)| (n.clone(), b.clone()))
            })
            .collect();
        for (name, build) in &self.builds {
            if !self.devices.iter().any(|(n, _)| n == name) {
                ordered.push((name.clone(), build.clone()));
            }
        }
        ordered
    }

    pub fn device(&self, name: &str) -> Option<&DeviceHandle> {
        self.devices.iter().find(|(n, _)| n == name).map(|(_, d)| d)
    }

    pub fn build_info(&self, name: &str) -> Option<&BuildDescriptor> {
        self.builds.iter().find(|(n, _)| n == name).map(|(_, b)| b)
    }

    /// Finds a tracked device by serial.
    ///
    /// Linear scan; returns `None` rather than an error when absent.
    pub fn device_by_serial(&self, serial: &str) -> Option<DeviceHandle> {
        self.devices
            .iter()
            .find(|(_, d)| d.serial() == serial)
            .map(|(_, d)| d.clone())
    }

    /// Name under which `device` is tracked.
    pub fn device_name(&self, device: &DeviceHandle) -> Option<&str> {
        self.devices
            .iter()
            .find(|(_, d)| d.serial() == device.serial())
            .map(|(n, _)| n.as_str())
    }

    /// Appends `value` to the values stored under `key`.
    pub fn add_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| *k == key) {
            Some((_, values)) => values.push(value),
            None => self.attributes.push((key, vec![value])),
        }
    }

    /// All values stored under `key`, in insertion order.
    pub fn attributes(&self, key: &str) -> &[String] {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
            .unwrap_or(&[])
    }

    /// Applies a recovery policy to every tracked device.
    pub fn set_recovery_mode_for_all_devices(&self, mode: RecoveryMode) {
        for (_, device) in &self.devices {
            device.set_recovery_mode(mode);
        }
    }

    /// Nests a module-level context under this invocation.
    pub fn set_module_context(&mut self, module_context: InvocationContext) {
        self.module_context = Some(Box::new(module_context));
    }

    pub fn module_context(&self) -> Option<&InvocationContext> {
        self.module_context.as_deref()
    }
}

impl std::fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let devices: Vec<(&str, &str)> = self
            .devices
            .iter()
            .map(|(n, d)| (n.as_str(), d.serial()))
            .collect();
        f.debug_struct("InvocationContext")
            .field("invocation_id", &self.invocation_id)
            .field("config_name", &self.config_name)
            .field("devices", &devices)
            .field("builds", &self.builds)
            .field("attributes", &self.attributes)
            .field("test_tag", &self.test_tag)
            .field("module_context", &self.module_context)
            .finish()
    }
}
