//! Hand-off of follow-up work to whoever runs commands.
//!
//! An invocation never runs its own continuations. Shard configurations,
//! resumed configurations and retry requests all go through a
//! [`Rescheduler`]; the command runner decides when they execute.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use super::configuration::Configuration;

/// Accepts configurations and commands to run later.
pub trait Rescheduler: Send + Sync {
    /// Queues `config` to run as its own invocation.
    ///
    /// Returns `false` if the configuration was not accepted.
    fn schedule_config(&self, config: Configuration) -> bool;

    /// Asks for the current command to be run again from scratch.
    fn reschedule_command(&self) -> bool;
}

/// Rescheduler that refuses everything.
pub struct NoopRescheduler;

impl Rescheduler for NoopRescheduler {
    fn schedule_config(&self, _config: Configuration) -> bool {
        false
    }

    fn reschedule_command(&self) -> bool {
        false
    }
}

/// Rescheduler backed by an in-memory queue, drained by the caller.
#[derive(Default)]
pub struct QueueRescheduler {
    queue: Mutex<VecDeque<Configuration>>,
    retries_requested: AtomicUsize,
    closed: AtomicBool,
}

impl QueueRescheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes every configuration scheduled so far.
    pub fn take_scheduled(&self) -> Vec<Configuration> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    pub fn pending(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns and clears the number of retry requests received.
    pub fn take_retry_requests(&self) -> usize {
        self.retries_requested.swap(0, Ordering::SeqCst)
    }

    /// Refuse all further scheduling.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Rescheduler for QueueRescheduler {
    fn schedule_config(&self, config: Configuration) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(config);
        true
    }

    fn reschedule_command(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.retries_requested.fetch_add(1, Ordering::SeqCst);
        true
    }
}
