//! Build descriptors and build providers.
//!
//! A [`BuildProvider`] hands the invocation an opaque [`BuildDescriptor`]
//! for each allocated device. The orchestrator only ever reads the
//! descriptor's identity and passes it along to preparers and tests.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::device::DeviceHandle;
use crate::error::{HarnessError, HarnessResult};

/// Identity and artifacts of the build under test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDescriptor {
    pub build_id: String,

    pub build_flavor: Option<String>,

    pub branch: Option<String>,

    /// Named artifact files belonging to this build.
    #[serde(default)]
    pub files: BTreeMap<String, PathBuf>,

    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl BuildDescriptor {
    pub fn new(build_id: impl Into<String>) -> Self {
        Self {
            build_id: build_id.into(),
            ..Default::default()
        }
    }

    pub fn with_flavor(mut self, flavor: impl Into<String>) -> Self {
        self.build_flavor = Some(flavor.into());
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_file(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.files.insert(name.into(), path.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Source of builds for an invocation.
#[async_trait]
pub trait BuildProvider: Send + Sync {
    /// Fetches the build to test on `device`.
    ///
    /// Returns `Ok(None)` when no build is currently available; the
    /// invocation then reschedules itself instead of failing.
    async fn fetch_build(
        &self,
        device: Option<&DeviceHandle>,
    ) -> HarnessResult<Option<BuildDescriptor>>;

    /// Releases any local resources held for `build`.
    async fn release_build(&self, _build: &BuildDescriptor) {}

    /// Marks `build` as not tested so it can be offered again.
    async fn mark_build_untested(&self, _build: &BuildDescriptor) {}
}

/// Provider that always offers the same, statically configured build.
///
/// Artifact files are checked for existence on every fetch.
pub struct StaticBuildProvider {
    build: Option<BuildDescriptor>,
}

impl StaticBuildProvider {
    pub fn new(build: BuildDescriptor) -> Self {
        Self { build: Some(build) }
    }

    /// A provider that never has a build available.
    pub fn empty() -> Self {
        Self { build: None }
    }
}

#[async_trait]
impl BuildProvider for StaticBuildProvider {
    async fn fetch_build(
        &self,
        device: Option<&DeviceHandle>,
    ) -> HarnessResult<Option<BuildDescriptor>> {
        let Some(build) = &self.build else {
            return Ok(None);
        };
        for (name, path) in &build.files {
            if !path.exists() {
                return Err(HarnessError::BuildRetrieval(format!(
                    "artifact `{}` of build {} not found at {}",
                    name,
                    build.build_id,
                    path.display()
                )));
            }
        }
        debug!(
            "Providing build {} for {}",
            build.build_id,
            device.map(|d| d.serial()).unwrap_or("<no device>")
        );
        Ok(Some(build.clone()))
    }

    async fn mark_build_untested(&self, build: &BuildDescriptor) {
        info!("Build {} marked as not tested", build.build_id);
    }
}

/// Provider that re-offers a build fetched by an earlier attempt.
///
/// Used when an invocation is resumed or split into shards, so the new
/// attempts test exactly the build the original attempt fetched.
pub struct ExistingBuildProvider {
    build: BuildDescriptor,
    original: Arc<dyn BuildProvider>,
}

impl ExistingBuildProvider {
    pub fn new(build: BuildDescriptor, original: Arc<dyn BuildProvider>) -> Self {
        Self { build, original }
    }
}

#[async_trait]
impl BuildProvider for ExistingBuildProvider {
    async fn fetch_build(
        &self,
        _device: Option<&DeviceHandle>,
    ) -> HarnessResult<Option<BuildDescriptor>> {
        Ok(Some(self.build.clone()))
    }

    async fn release_build(&self, build: &BuildDescriptor) {
        self.original.release_build(build).await;
    }

    async fn mark_build_untested(&self, build: &BuildDescriptor) {
        self.original.mark_build_untested(build).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_provider() {
        let provider = StaticBuildProvider::new(BuildDescriptor::new("1234").with_branch("main"));
        let build = provider.fetch_build(None).await.unwrap().unwrap();
        assert_eq!(build.build_id, "1234");
        assert_eq!(build.branch.as_deref(), Some("main"));

        assert!(StaticBuildProvider::empty().fetch_build(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_static_provider_checks_artifacts() {
        let provider = StaticBuildProvider::new(
            BuildDescriptor::new("1234").with_file("image", "/definitely/not/here.img"),
        );
        let err = provider.fetch_build(None).await.unwrap_err();
        assert!(matches!(err, HarnessError::BuildRetrieval(_)));
    }

    #[tokio::test]
    async fn test_existing_provider_reoffers_build() {
        let original: Arc<dyn BuildProvider> = Arc::new(StaticBuildProvider::empty());
        let provider = ExistingBuildProvider::new(BuildDescriptor::new("42"), original);
        let build = provider.fetch_build(None).await.unwrap().unwrap();
        assert_eq!(build.build_id, "42");
    }
}
