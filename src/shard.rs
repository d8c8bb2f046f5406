//! Aggregation of sharded invocations.
//!
//! When an invocation is split into shards, every shard runs as its own
//! invocation on its own task, but the listeners of the original
//! configuration must see a single invocation:
//!
//! ```text
//!  shard 0 ──► ShardListener ─┐
//!  shard 1 ──► ShardListener ─┼─► mpsc ─► ShardAggregator task ─► ShardMasterResultForwarder ─► listeners
//!  shard 2 ──► ShardListener ─┘
//! ```
//!
//! A [`ShardListener`] forwards logs immediately and buffers every other
//! event until its shard ends, then ships the whole batch at once, so
//! batches from different shards never interleave. The master forwards
//! `invocation_started` once and `invocation_ended` once, when the last
//! shard is done, with the summed elapsed time of every shard.

pub mod helper;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::InvocationContext;
use crate::error::FailureDescription;
use crate::listener::{InvocationEvent, ResultForwarder, TestListener};
use crate::result::{LogDataType, LogStream, Metrics, TestDescription};

pub use helper::{ShardHelper, ShardOutcome, ShardStrategy};

struct MasterState {
    expected: usize,
    remaining: usize,
    total_elapsed: Duration,
    first_shard_end: Option<DateTime<Utc>>,
    started_reported: bool,
}

/// Merges the invocation lifecycle of N shards into one.
pub struct ShardMasterResultForwarder {
    listeners: ResultForwarder,
    state: Mutex<MasterState>,
}

impl ShardMasterResultForwarder {
    pub fn new(listeners: ResultForwarder, shard_count: usize) -> Self {
        Self {
            listeners,
            state: Mutex::new(MasterState {
                expected: shard_count,
                remaining: shard_count,
                total_elapsed: Duration::ZERO,
                first_shard_end: None,
                started_reported: false,
            }),
        }
    }

    /// Number of shards that have not ended yet.
    pub fn remaining_shards(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remaining
    }

    /// When the first shard ended, if any has.
    pub fn first_shard_end(&self) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .first_shard_end
    }
}

#[async_trait]
impl TestListener for ShardMasterResultForwarder {
    async fn invocation_started(&self, context: &InvocationContext) {
        let first = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            !std::mem::replace(&mut state.started_reported, true)
        };
        if first {
            self.listeners.invocation_started(context).await;
        }
    }

    async fn invocation_failed(&self, failure: &FailureDescription) {
        self.listeners.invocation_failed(failure).await;
    }

    async fn invocation_ended(&self, elapsed: Duration) {
        let total = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.remaining == 0 {
                warn!("Ignoring invocation end from an extra shard");
                return;
            }
            state.total_elapsed += elapsed;
            state.remaining -= 1;
            let now = Utc::now();
            let first_end = *state.first_shard_end.get_or_insert(now);
            debug!(
                "Shard ended, {} of {} remaining",
                state.remaining, state.expected
            );
            if state.remaining > 0 {
                return;
            }
            info!(
                "All {} shards done, {:?} after the first one finished",
                state.expected,
                (now - first_end).to_std().unwrap_or_default()
            );
            state.total_elapsed
        };
        self.listeners.invocation_ended(total).await;
    }

    async fn test_module_started(&self, module_context: &InvocationContext) {
        self.listeners.test_module_started(module_context).await;
    }

    async fn test_module_ended(&self) {
        self.listeners.test_module_ended().await;
    }

    async fn test_run_started(&self, run_name: &str, test_count: usize) {
        self.listeners.test_run_started(run_name, test_count).await;
    }

    async fn test_started(&self, test: &TestDescription) {
        self.listeners.test_started(test).await;
    }

    async fn test_failed(&self, test: &TestDescription, trace: &str) {
        self.listeners.test_failed(test, trace).await;
    }

    async fn test_assumption_failure(&self, test: &TestDescription, trace: &str) {
        self.listeners.test_assumption_failure(test, trace).await;
    }

    async fn test_ignored(&self, test: &TestDescription) {
        self.listeners.test_ignored(test).await;
    }

    async fn test_ended(&self, test: &TestDescription, metrics: &Metrics) {
        self.listeners.test_ended(test, metrics).await;
    }

    async fn test_run_failed(&self, message: &str) {
        self.listeners.test_run_failed(message).await;
    }

    async fn test_run_ended(&self, elapsed: Duration, metrics: &Metrics) {
        self.listeners.test_run_ended(elapsed, metrics).await;
    }

    async fn test_log(&self, name: &str, data_type: LogDataType, stream: &LogStream) {
        self.listeners.test_log(name, data_type, stream).await;
    }
}

/// Message sent from a shard to the aggregator.
#[derive(Debug)]
pub enum ShardMessage {
    /// A log captured by the shard, forwarded right away.
    Log(InvocationEvent),

    /// Every buffered event of a finished shard.
    Completed {
        shard_index: usize,
        events: Vec<InvocationEvent>,
    },
}

/// Listener installed in each shard configuration.
pub struct ShardListener {
    shard_index: usize,
    sender: mpsc::UnboundedSender<ShardMessage>,
    buffer: Mutex<Vec<InvocationEvent>>,
}

impl ShardListener {
    fn buffer(&self, event: InvocationEvent) {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    fn send(&self, message: ShardMessage) {
        if self.sender.send(message).is_err() {
            warn!("Shard {}: aggregator is gone, dropping results", self.shard_index);
        }
    }
}

#[async_trait]
impl TestListener for ShardListener {
    async fn invocation_started(&self, context: &InvocationContext) {
        self.buffer(InvocationEvent::InvocationStarted(context.clone()));
    }

    async fn invocation_failed(&self, failure: &FailureDescription) {
        self.buffer(InvocationEvent::InvocationFailed(failure.clone()));
    }

    async fn invocation_ended(&self, elapsed: Duration) {
        let mut events = std::mem::take(
            &mut *self.buffer.lock().unwrap_or_else(PoisonError::into_inner),
        );
        events.push(InvocationEvent::InvocationEnded(elapsed));
        debug!("Shard {} done, forwarding {} events", self.shard_index, events.len());
        self.send(ShardMessage::Completed {
            shard_index: self.shard_index,
            events,
        });
    }

    async fn test_module_started(&self, module_context: &InvocationContext) {
        self.buffer(InvocationEvent::ModuleStarted(module_context.clone()));
    }

    async fn test_module_ended(&self) {
        self.buffer(InvocationEvent::ModuleEnded);
    }

    async fn test_run_started(&self, run_name: &str, test_count: usize) {
        self.buffer(InvocationEvent::RunStarted {
            name: run_name.to_string(),
            test_count,
        });
    }

    async fn test_started(&self, test: &TestDescription) {
        self.buffer(InvocationEvent::TestStarted(test.clone()));
    }

    async fn test_failed(&self, test: &TestDescription, trace: &str) {
        self.buffer(InvocationEvent::TestFailed(test.clone(), trace.to_string()));
    }

    async fn test_assumption_failure(&self, test: &TestDescription, trace: &str) {
        self.buffer(InvocationEvent::TestAssumptionFailure(
            test.clone(),
            trace.to_string(),
        ));
    }

    async fn test_ignored(&self, test: &TestDescription) {
        self.buffer(InvocationEvent::TestIgnored(test.clone()));
    }

    async fn test_ended(&self, test: &TestDescription, metrics: &Metrics) {
        self.buffer(InvocationEvent::TestEnded(test.clone(), metrics.clone()));
    }

    async fn test_run_failed(&self, message: &str) {
        self.buffer(InvocationEvent::RunFailed(message.to_string()));
    }

    async fn test_run_ended(&self, elapsed: Duration, metrics: &Metrics) {
        self.buffer(InvocationEvent::RunEnded(elapsed, metrics.clone()));
    }

    async fn test_log(&self, name: &str, data_type: LogDataType, stream: &LogStream) {
        self.send(ShardMessage::Log(InvocationEvent::Log {
            name: format!("{}_shard{}", name, self.shard_index),
            data_type,
            stream: stream.clone(),
        }));
    }
}

/// Task that replays shard batches into the master forwarder.
pub struct ShardAggregator {
    master: Arc<ShardMasterResultForwarder>,
    sender: mpsc::UnboundedSender<ShardMessage>,
    task: JoinHandle<()>,
}

impl ShardAggregator {
    /// Spawns the aggregation task. Must be called within a tokio runtime.
    pub fn spawn(master: Arc<ShardMasterResultForwarder>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let task_master = master.clone();
        let task = tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                match message {
                    ShardMessage::Log(event) => event.replay(task_master.as_ref()).await,
                    ShardMessage::Completed {
                        shard_index,
                        events,
                    } => {
                        debug!("Replaying {} events of shard {}", events.len(), shard_index);
                        for event in &events {
                            event.replay(task_master.as_ref()).await;
                        }
                    }
                }
            }
            let remaining = task_master.remaining_shards();
            if remaining > 0 {
                warn!("{} shards never reported their end", remaining);
            }
        });
        Self {
            master,
            sender,
            task,
        }
    }

    pub fn master(&self) -> &Arc<ShardMasterResultForwarder> {
        &self.master
    }

    /// Creates the listener for shard `shard_index`.
    pub fn shard_listener(&self, shard_index: usize) -> ShardListener {
        ShardListener {
            shard_index,
            sender: self.sender.clone(),
            buffer: Mutex::new(Vec::new()),
        }
    }

    /// Stops handing out listeners.
    ///
    /// The returned task finishes once every shard listener is dropped.
    pub fn into_task(self) -> JoinHandle<()> {
        self.task
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::CollectingListener;

    #[tokio::test]
    async fn test_master_forwards_start_once_and_end_once() {
        let collector = Arc::new(CollectingListener::new());
        let master = ShardMasterResultForwarder::new(ResultForwarder::new(vec![collector.clone()]), 3);
        let context = InvocationContext::new("cfg");

        for _ in 0..3 {
            master.invocation_started(&context).await;
        }
        master.invocation_ended(Duration::from_secs(1)).await;
        master.invocation_ended(Duration::from_secs(2)).await;
        assert!(collector.ended_invocations().is_empty());
        assert!(master.first_shard_end().is_some());

        master.invocation_ended(Duration::from_secs(3)).await;
        master.invocation_ended(Duration::from_secs(4)).await;

        assert_eq!(collector.invocation_started_count(), 1);
        assert_eq!(collector.ended_invocations(), vec![Duration::from_secs(6)]);
        assert_eq!(master.remaining_shards(), 0);
    }

    #[tokio::test]
    async fn test_shard_batches_do_not_interleave() {
        let collector = Arc::new(CollectingListener::new());
        let master = Arc::new(ShardMasterResultForwarder::new(
            ResultForwarder::new(vec![collector.clone()]),
            2,
        ));
        let aggregator = ShardAggregator::spawn(master);
        let first = aggregator.shard_listener(0);
        let second = aggregator.shard_listener(1);
        let task = aggregator.into_task();

        first.test_run_started("a", 1).await;
        second.test_run_started("b", 1).await;
        second
            .test_log("device_log", LogDataType::DeviceLog, &LogStream::from_bytes("x"))
            .await;
        second.test_run_ended(Duration::ZERO, &Metrics::new()).await;
        second.invocation_ended(Duration::from_secs(1)).await;
        first.test_run_ended(Duration::ZERO, &Metrics::new()).await;
        first.invocation_ended(Duration::from_secs(2)).await;
        drop(first);
        drop(second);
        task.await.unwrap();

        let names: Vec<String> = collector.runs().iter().map(|r| r.name().to_string()).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert!(collector.runs().iter().all(|r| r.is_complete()));
        assert_eq!(collector.log_names(), vec!["device_log_shard1"]);
        assert_eq!(collector.ended_invocations(), vec![Duration::from_secs(3)]);
    }
}
