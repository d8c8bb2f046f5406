//! Command execution: one invocation plus everything it reschedules.
//!
//! The root invocation may hand shard configurations or a resumed
//! configuration to the [`QueueRescheduler`]. They are drained here in
//! waves, each wave running concurrently, until nothing new is scheduled.
//! Retry requests rerun the whole command, up to
//! `max_command_retries` times.

use std::sync::{Mutex, PoisonError};

use tracing::{error, info, warn};

use crate::context::InvocationContext;
use crate::invocation::{Configuration, InvocationStatus, QueueRescheduler, TestInvocation};
use crate::logging::HostLog;

/// Final state of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Status of the last attempt, folded over every invocation it spawned.
    pub status: InvocationStatus,

    /// Number of times the command ran.
    pub attempts: u32,

    /// Number of shard or resumed invocations run on behalf of the command.
    pub rescheduled_invocations: usize,
}

/// Runs `configuration` until it neither reschedules nor asks for a retry.
///
/// Must be called from a multi-threaded tokio runtime.
pub async fn execute_command(configuration: &Configuration, host_log: &HostLog) -> CommandOutcome {
    let max_retries = configuration.options.max_command_retries;
    let mut attempts = 0;
    let mut rescheduled_invocations = 0;

    loop {
        attempts += 1;
        let rescheduler = QueueRescheduler::new();
        let (status, spawned) = run_attempt(configuration, host_log, &rescheduler).await;
        rescheduled_invocations += spawned;

        let retries = rescheduler.take_retry_requests();
        if retries == 0 || attempts > max_retries || configuration.options.loop_mode {
            if retries > 0 {
                warn!("Retry requested but no attempts left ({} made)", attempts);
            }
            return CommandOutcome {
                status,
                attempts,
                rescheduled_invocations,
            };
        }
        info!("Retrying command (attempt {} of {})", attempts + 1, max_retries + 1);
    }
}

async fn run_attempt(
    configuration: &Configuration,
    host_log: &HostLog,
    rescheduler: &QueueRescheduler,
) -> (InvocationStatus, usize) {
    let mut invocation = TestInvocation::new(host_log.clone());
    let mut context = InvocationContext::new(&configuration.name);
    if let Err(e) = invocation.invoke(&mut context, configuration, rescheduler).await {
        error!("Invocation {} failed: {}", context.invocation_id(), e);
    }
    let status = invocation.status();
    let aggregation = invocation.take_shard_aggregation();

    let children = drain_scheduled(host_log, rescheduler).await;
    let spawned = children.len();

    if let Some(task) = aggregation
        && let Err(e) = task.await
    {
        error!("Shard aggregation failed: {}", e);
    }

    let status = match status {
        InvocationStatus::Sharded | InvocationStatus::Resumed => fold_statuses(&children),
        other => other,
    };
    (status, spawned)
}

/// Runs every scheduled configuration, wave after wave, concurrently
/// within a wave. Closes the rescheduler once the queue is empty.
async fn drain_scheduled(host_log: &HostLog, rescheduler: &QueueRescheduler) -> Vec<InvocationStatus> {
    let statuses = Mutex::new(Vec::new());
    loop {
        let wave = rescheduler.take_scheduled();
        if wave.is_empty() {
            break;
        }
        info!("Running {} rescheduled invocations", wave.len());

        tokio_scoped::scope(|scope| {
            for config in wave {
                let statuses = &statuses;
                scope.spawn(async move {
                    let mut invocation = TestInvocation::new(host_log.clone());
                    let mut context = InvocationContext::new(&config.name);
                    if let Err(e) = invocation.invoke(&mut context, &config, rescheduler).await {
                        error!("Invocation of `{}` failed: {}", config.name, e);
                    }
                    statuses
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(invocation.status());
                });
            }
        });
    }
    rescheduler.close();
    statuses.into_inner().unwrap_or_else(PoisonError::into_inner)
}

/// Worst status among `statuses`, ignoring intermediate ones.
fn fold_statuses(statuses: &[InvocationStatus]) -> InvocationStatus {
    statuses
        .iter()
        .copied()
        .filter(|s| !matches!(s, InvocationStatus::Sharded | InvocationStatus::Resumed))
        .max_by_key(|s| match s {
            InvocationStatus::Success => 0,
            InvocationStatus::Failed => 3,
            InvocationStatus::NoBuild => 1,
            InvocationStatus::Pending => 2,
            InvocationStatus::BuildRetrievalError => 4,
            InvocationStatus::DeviceUnavailable => 5,
            InvocationStatus::Sharded | InvocationStatus::Resumed => 0,
        })
        .unwrap_or(InvocationStatus::Success)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_statuses_takes_worst() {
        use InvocationStatus::*;
        assert_eq!(fold_statuses(&[]), Success);
        assert_eq!(fold_statuses(&[Success, Resumed, Success]), Success);
        assert_eq!(fold_statuses(&[Success, Failed]), Failed);
        assert_eq!(fold_statuses(&[Failed, DeviceUnavailable, Success]), DeviceUnavailable);
    }
}
