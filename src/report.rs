//! Result reporting: console progress, JUnit XML, saved logs and the final
//! summary.
//!
//! Every reporter is a [`TestListener`](crate::listener::TestListener), so
//! it receives exactly the event stream the invocation produces, whether
//! the invocation ran directly, was sharded or was resumed.

pub mod console;
pub mod junit;
pub mod logs;

use std::time::Duration;

use serde::Serialize;

pub use console::ConsoleReporter;
pub use junit::JunitReporter;
pub use logs::LogSaver;

use crate::listener::CollectingListener;
use crate::result::{TestRunResult, TestStatus};

/// Totals over every run of an invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub runs: usize,
    pub total_tests: usize,
    pub passed: usize,
    pub failed: usize,
    pub ignored: usize,
    pub assumption_failures: usize,
    pub incomplete: usize,
    /// Messages of every `test_run_failed`, prefixed with the run name.
    pub run_failures: Vec<String>,
    pub invocation_failures: Vec<String>,
    /// Elapsed time of the invocation, as reported by `invocation_ended`.
    #[serde(with = "duration_secs")]
    pub duration: Duration,
}

impl RunSummary {
    pub fn from_runs(runs: &[TestRunResult]) -> Self {
        let mut summary = RunSummary {
            runs: runs.len(),
            ..Default::default()
        };
        for run in runs {
            summary.total_tests += run.num_tests();
            summary.passed += run.num_tests_in_state(TestStatus::Passed);
            summary.failed += run.num_tests_in_state(TestStatus::Failure);
            summary.ignored += run.num_tests_in_state(TestStatus::Ignored);
            summary.assumption_failures += run.num_tests_in_state(TestStatus::AssumptionFailure);
            summary.incomplete += run.num_tests_in_state(TestStatus::Incomplete);
            summary.run_failures.extend(
                run.run_failures()
                    .iter()
                    .map(|message| format!("{}: {}", run.name(), message)),
            );
        }
        summary
    }

    pub fn from_listener(listener: &CollectingListener) -> Self {
        let mut summary = Self::from_runs(&listener.runs());
        summary.invocation_failures = listener
            .invocation_failures()
            .into_iter()
            .map(|failure| failure.message)
            .collect();
        summary.duration = listener.ended_invocations().into_iter().sum();
        summary
    }

    /// Returns `true` if nothing failed at any level.
    pub fn success(&self) -> bool {
        self.failed == 0
            && self.incomplete == 0
            && self.run_failures.is_empty()
            && self.invocation_failures.is_empty()
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }
}

/// Prints a summary of the invocation to the console.
///
/// Displays pass/fail counts with colored output followed by every run
/// and invocation failure.
pub fn print_summary(summary: &RunSummary) {
    println!();
    println!("Test Results:");
    println!("  Runs:    {}", summary.runs);
    println!("  Total:   {}", summary.total_tests);
    println!("  Passed:  {}", ::console::style(summary.passed).green());
    println!("  Failed:  {}", ::console::style(summary.failed).red());
    println!("  Ignored: {}", ::console::style(summary.ignored).yellow());

    if summary.assumption_failures > 0 {
        println!(
            "  Assumption failures: {}",
            ::console::style(summary.assumption_failures).yellow()
        );
    }

    if summary.incomplete > 0 {
        println!(
            "  Incomplete: {}",
            ::console::style(summary.incomplete).red().bold()
        );
    }

    println!("  Duration: {:?}", summary.duration);

    if summary.success() {
        println!();
        println!("{}", ::console::style("All tests passed!").green().bold());
        return;
    }

    println!();
    if !summary.invocation_failures.is_empty() {
        println!("{}", ::console::style("Invocation failed:").red().bold());
        for failure in &summary.invocation_failures {
            println!("  - {}", failure);
        }
    }
    if !summary.run_failures.is_empty() {
        println!("{}", ::console::style("Run failures:").red().bold());
        for failure in &summary.run_failures {
            println!("  - {}", ::console::style(failure).dim());
        }
    }
    if summary.failed > 0 || summary.incomplete > 0 {
        println!("{}", ::console::style("Some tests failed.").red().bold());
    }
}
