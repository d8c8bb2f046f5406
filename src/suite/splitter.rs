//! Partitioning of module configurations into runnable modules.
//!
//! | Configuration | `shard_count` | Static mode | Dynamic mode |
//! |---------------|---------------|-------------|--------------|
//! | any | absent or 1 | one module with every unit | same |
//! | not shardable | n | one module per unit | `min(n, units)` modules sharing one pool |
//! | shardable | n | each unit split in up to n pieces, one module per piece | split in up to 2n pieces, `min(n, pieces)` modules sharing one pool |
//!
//! A shardable unit that refuses to split becomes a single-unit module.

use tracing::debug;

use super::module::ModuleDefinition;
use super::pool::TestPool;
use crate::error::{HarnessError, HarnessResult};
use crate::preparer::TargetPreparer;
use crate::remote_test::TestHandle;

/// A named group of test units with the preparers they need.
#[derive(Clone)]
pub struct ModuleConfig {
    pub name: String,
    pub tests: Vec<TestHandle>,
    pub preparers: Vec<Box<dyn TargetPreparer>>,

    /// Units of this module must not be split.
    pub not_shardable: bool,

    /// A build provider this module wants for itself.
    ///
    /// Modules run inside a suite share the suite's build, so this must be
    /// unset.
    pub build_provider: Option<String>,

    /// Result reporters this module wants for itself. Must be empty.
    pub result_reporters: Vec<String>,
}

impl ModuleConfig {
    pub fn new(name: impl Into<String>, tests: Vec<TestHandle>) -> Self {
        Self {
            name: name.into(),
            tests,
            preparers: Vec::new(),
            not_shardable: false,
            build_provider: None,
            result_reporters: Vec::new(),
        }
    }

    pub fn with_preparer(mut self, preparer: Box<dyn TargetPreparer>) -> Self {
        self.preparers.push(preparer);
        self
    }

    pub fn not_shardable(mut self, not_shardable: bool) -> Self {
        self.not_shardable = not_shardable;
        self
    }

    /// Checks the module can run as part of a suite.
    pub fn validate_suite_runnable(&self) -> HarnessResult<()> {
        if let Some(provider) = &self.build_provider {
            return Err(HarnessError::Config(format!(
                "module {} declares its own build provider `{}`; modules in a suite share the suite's build",
                self.name, provider
            )));
        }
        if !self.result_reporters.is_empty() {
            return Err(HarnessError::Config(format!(
                "module {} declares its own result reporters ({}); modules in a suite report through the suite",
                self.name,
                self.result_reporters.join(", ")
            )));
        }
        Ok(())
    }

    fn module(&self, units: Vec<TestHandle>) -> ModuleDefinition {
        self.shared_module(TestPool::new(units))
    }

    fn shared_module(&self, pool: TestPool) -> ModuleDefinition {
        let preparers = self.preparers.iter().map(|p| p.clone_box()).collect();
        ModuleDefinition::new(&self.name, pool, preparers)
    }

    fn distribute(
        &self,
        units: Vec<TestHandle>,
        shard_count: usize,
        dynamic: bool,
        modules: &mut Vec<ModuleDefinition>,
    ) {
        if dynamic {
            let count = shard_count.min(units.len());
            let pool = TestPool::new(units);
            modules.extend((0..count).map(|_| self.shared_module(pool.clone())));
        } else {
            modules.extend(units.into_iter().map(|unit| self.module(vec![unit])));
        }
    }
}

/// Splits `configs` into an ordered list of modules.
///
/// # Errors
///
/// [`HarnessError::Config`] if a configuration cannot run inside a suite,
/// or any error a unit raises while splitting.
pub fn split_configuration(
    configs: &[ModuleConfig],
    shard_count: Option<usize>,
    dynamic: bool,
) -> HarnessResult<Vec<ModuleDefinition>> {
    let mut modules = Vec::new();
    for config in configs {
        config.validate_suite_runnable()?;
        if config.tests.is_empty() {
            debug!("Module {} has no tests, skipping", config.name);
            continue;
        }

        let shard_count = match shard_count {
            Some(count) if count > 1 => count,
            _ => {
                modules.push(config.module(config.tests.clone()));
                continue;
            }
        };

        if config.not_shardable {
            config.distribute(config.tests.clone(), shard_count, dynamic, &mut modules);
            continue;
        }

        let hint = if dynamic { shard_count * 2 } else { shard_count };
        for unit in &config.tests {
            match unit.split(hint)? {
                Some(pieces) if !pieces.is_empty() => {
                    config.distribute(pieces, shard_count, dynamic, &mut modules)
                }
                _ => modules.push(config.module(vec![unit.clone()])),
            }
        }
    }
    debug!("Split {} configurations into {} modules", configs.len(), modules.len());
    Ok(modules)
}
