//! Splitting a configuration into shard configurations.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::build_info::ExistingBuildProvider;
use crate::context::InvocationContext;
use crate::error::{FailureCategory, FailureDescription, HarnessResult};
use crate::invocation::configuration::Configuration;
use crate::invocation::rescheduler::Rescheduler;
use crate::listener::TestListener;
use crate::remote_test::TestHandle;
use crate::scheduler::Scheduler;

use super::{ShardAggregator, ShardMasterResultForwarder};

/// Result of asking a [`ShardStrategy`] to shard an invocation.
#[derive(Debug)]
pub enum ShardOutcome {
    /// Nothing was sharded; the invocation runs its tests itself.
    NotSharded,

    /// Shard configurations were handed to the rescheduler. The task
    /// completes once every shard has reported back.
    Sharded(JoinHandle<()>),
}

impl ShardOutcome {
    pub fn is_sharded(&self) -> bool {
        matches!(self, ShardOutcome::Sharded(_))
    }
}

/// Decides whether and how an invocation is split into shards.
#[async_trait]
pub trait ShardStrategy: Send + Sync {
    /// Shards `config` if appropriate, scheduling every shard through
    /// `rescheduler`.
    ///
    /// `context` must already hold the devices and the fetched builds.
    async fn shard_config(
        &self,
        config: &Configuration,
        context: &InvocationContext,
        rescheduler: &dyn Rescheduler,
    ) -> HarnessResult<ShardOutcome>;
}

/// Default strategy: splits every test that supports it, balances the
/// pieces into `shard_count` buckets and schedules one configuration per
/// non-empty bucket.
pub struct ShardHelper;

#[async_trait]
impl ShardStrategy for ShardHelper {
    async fn shard_config(
        &self,
        config: &Configuration,
        context: &InvocationContext,
        rescheduler: &dyn Rescheduler,
    ) -> HarnessResult<ShardOutcome> {
        let shard_count = match config.options.shard_count {
            Some(count) if count > 1 => count,
            _ => return Ok(ShardOutcome::NotSharded),
        };
        if config.options.shard_index.is_some() {
            return Ok(ShardOutcome::NotSharded);
        }

        let mut pieces: Vec<TestHandle> = Vec::new();
        let mut any_split = false;
        for test in &config.tests {
            match test.split(shard_count)? {
                Some(split) => {
                    any_split = true;
                    pieces.extend(split);
                }
                None => pieces.push(test.clone()),
            }
        }
        if !any_split {
            info!("No test of `{}` can be sharded, running unsharded", config.name);
            return Ok(ShardOutcome::NotSharded);
        }

        let buckets = Scheduler::new(shard_count).schedule(pieces);
        info!(
            "Sharding `{}` into {} shards (requested {})",
            config.name,
            buckets.len(),
            shard_count
        );

        let master = Arc::new(ShardMasterResultForwarder::new(
            config.listener(),
            buckets.len(),
        ));
        master.invocation_started(context).await;
        let aggregator = ShardAggregator::spawn(master);

        for (index, tests) in buckets.into_iter().enumerate() {
            let listener = Arc::new(aggregator.shard_listener(index));
            let shard = shard_configuration(config, context, index, tests, listener.clone());
            if !rescheduler.schedule_config(shard) {
                warn!("Shard {} of `{}` could not be scheduled", index, config.name);
                listener
                    .invocation_failed(&FailureDescription::new(
                        format!("Failed to schedule shard {}", index),
                        FailureCategory::Infra,
                    ))
                    .await;
                listener.invocation_ended(std::time::Duration::ZERO).await;
            }
        }

        Ok(ShardOutcome::Sharded(aggregator.into_task()))
    }
}

fn shard_configuration(
    config: &Configuration,
    context: &InvocationContext,
    index: usize,
    tests: Vec<TestHandle>,
    listener: Arc<dyn TestListener>,
) -> Configuration {
    let mut shard = config.clone();
    shard.name = format!("{}-shard{}", config.name, index);
    shard.tests = tests;
    shard.listeners = vec![listener];
    shard.options.shard_index = Some(index);
    for device in &mut shard.devices {
        if let Some(build) = context.build_info(&device.name) {
            device.build_provider = Arc::new(ExistingBuildProvider::new(
                build.clone(),
                device.build_provider.clone(),
            ));
        }
    }
    shard
}
