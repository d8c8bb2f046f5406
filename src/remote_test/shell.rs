//! Test unit that runs shell commands on the device.
//!
//! Each [`ShellCase`] is one test case: it passes when its command exits
//! with status 0. The build id, when injected, is exported to every case
//! as `DEVRUN_BUILD_ID`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{RemoteTest, TestCapabilities, TestHandle, TestInformation};
use crate::device::Command;
use crate::error::{HarnessError, HarnessResult};
use crate::listener::TestListener;
use crate::result::{Metrics, TestDescription};
use crate::scheduler::Scheduler;

/// Maximum number of output lines kept in a failure trace.
const TRACE_TAIL_LINES: usize = 40;

/// A single named shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCase {
    pub name: String,
    pub command: Command,
}

impl ShellCase {
    pub fn new(name: impl Into<String>, command: Command) -> Self {
        Self {
            name: name.into(),
            command,
        }
    }
}

/// A test unit made of shell cases.
///
/// A resumable unit remembers which cases already ran, so running it again
/// after a device loss only executes what is left.
pub struct ShellTest {
    name: String,
    cases: Vec<ShellCase>,
    resumable: bool,
    retriable: bool,
    completed: Mutex<HashSet<String>>,
}

impl ShellTest {
    pub fn new(name: impl Into<String>, cases: Vec<ShellCase>) -> Self {
        Self {
            name: name.into(),
            cases,
            resumable: false,
            retriable: false,
            completed: Mutex::new(HashSet::new()),
        }
    }

    pub fn resumable(mut self, resumable: bool) -> Self {
        self.resumable = resumable;
        self
    }

    pub fn retriable(mut self, retriable: bool) -> Self {
        self.retriable = retriable;
        self
    }

    pub fn cases(&self) -> &[ShellCase] {
        &self.cases
    }

    fn pending_cases(&self) -> Vec<ShellCase> {
        if !self.resumable {
            return self.cases.clone();
        }
        let completed = self.completed.lock().unwrap_or_else(PoisonError::into_inner);
        self.cases
            .iter()
            .filter(|c| !completed.contains(&c.name))
            .cloned()
            .collect()
    }

    fn mark_completed(&self, case: &ShellCase) {
        if self.resumable {
            self.completed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(case.name.clone());
        }
    }
}

#[async_trait]
impl RemoteTest for ShellTest {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> TestCapabilities {
        TestCapabilities {
            device_bound: true,
            build_bound: true,
            resumable: self.resumable,
            retriable: self.retriable,
            collector: true,
        }
    }

    async fn run(
        &self,
        info: &TestInformation<'_>,
        listener: &dyn TestListener,
    ) -> HarnessResult<()> {
        let cases = self.pending_cases();
        let start = Instant::now();
        listener.test_run_started(&self.name, cases.len()).await;

        if info.collect_only {
            for case in &cases {
                let test = TestDescription::new(&self.name, &case.name);
                listener.test_started(&test).await;
                listener.test_ended(&test, &Metrics::new()).await;
            }
            listener.test_run_ended(start.elapsed(), &Metrics::new()).await;
            return Ok(());
        }

        let Some(device) = &info.device else {
            let message = format!("{} needs a device but none was injected", self.name);
            listener.test_run_failed(&message).await;
            listener.test_run_ended(start.elapsed(), &Metrics::new()).await;
            return Err(HarnessError::Runtime(message));
        };

        for case in cases {
            let test = TestDescription::new(&self.name, &case.name);
            let mut command = case.command.clone();
            if let Some(build) = &info.build {
                command = command.env("DEVRUN_BUILD_ID", &build.build_id);
            }

            listener.test_started(&test).await;
            match device.run_shell_command(&command).await {
                Ok(result) => {
                    let mut metrics = Metrics::new();
                    metrics.insert("exit_code".into(), result.exit_code.to_string());
                    if !result.success() {
                        debug!("{} failed with exit code {}", test, result.exit_code);
                        listener.test_failed(&test, &failure_trace(&result)).await;
                    }
                    listener.test_ended(&test, &metrics).await;
                    self.mark_completed(&case);
                }
                Err(e) => {
                    warn!("{} aborted: {}", test, e);
                    listener.test_failed(&test, &e.to_string()).await;
                    listener.test_ended(&test, &Metrics::new()).await;
                    listener.test_run_failed(&e.to_string()).await;
                    listener.test_run_ended(start.elapsed(), &Metrics::new()).await;
                    return Err(e);
                }
            }
        }

        listener.test_run_ended(start.elapsed(), &Metrics::new()).await;
        Ok(())
    }

    fn split(&self, shard_count_hint: usize) -> HarnessResult<Option<Vec<TestHandle>>> {
        if shard_count_hint <= 1 || self.cases.len() <= 1 {
            return Ok(None);
        }
        let pieces = Scheduler::new(shard_count_hint)
            .schedule(self.cases.clone())
            .into_iter()
            .map(|cases| {
                Arc::new(
                    ShellTest::new(&self.name, cases)
                        .resumable(self.resumable)
                        .retriable(self.retriable),
                ) as TestHandle
            })
            .collect();
        Ok(Some(pieces))
    }
}

fn failure_trace(result: &crate::device::ExecResult) -> String {
    let output = if result.stderr.trim().is_empty() {
        &result.stdout
    } else {
        &result.stderr
    };
    let lines: Vec<&str> = output.lines().collect();
    let tail = &lines[lines.len().saturating_sub(TRACE_TAIL_LINES)..];
    format!("exit code {}\n{}", result.exit_code, tail.join("\n"))
}
