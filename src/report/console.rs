//! Terminal progress output.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};

use crate::context::InvocationContext;
use crate::error::FailureDescription;
use crate::listener::TestListener;
use crate::result::{Metrics, TestDescription};

#[derive(Default)]
struct Progress {
    bar: Option<ProgressBar>,
    current_failed: bool,
}

/// Console reporter that shows a spinner and one line per finished test.
///
/// Passing tests are only printed in verbose mode.
pub struct ConsoleReporter {
    progress: Mutex<Progress>,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(Progress::default()),
            verbose,
        }
    }

    fn println(&self, line: String) {
        let progress = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
        match &progress.bar {
            Some(bar) => bar.println(line),
            None => println!("{}", line),
        }
    }
}

#[async_trait]
impl TestListener for ConsoleReporter {
    async fn invocation_started(&self, context: &InvocationContext) {
        println!(
            "Invocation {} ({})",
            context.invocation_id(),
            context.config_name()
        );

        let bar = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {pos} tests {msg}") {
            bar.set_style(style);
        }
        bar.enable_steady_tick(Duration::from_millis(120));
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .bar = Some(bar);
    }

    async fn invocation_failed(&self, failure: &FailureDescription) {
        self.println(format!(
            "{} {}",
            ::console::style("INVOCATION FAILED").red().bold(),
            failure
        ));
    }

    async fn invocation_ended(&self, _elapsed: Duration) {
        if let Some(bar) = self
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .bar
            .take()
        {
            bar.finish_and_clear();
        }
    }

    async fn test_run_started(&self, run_name: &str, test_count: usize) {
        let progress = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(bar) = &progress.bar {
            bar.set_message(run_name.to_string());
        }
        if self.verbose {
            drop(progress);
            self.println(format!("Run {} ({} tests)", run_name, test_count));
        }
    }

    async fn test_started(&self, test: &TestDescription) {
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .current_failed = false;
        if self.verbose {
            self.println(format!("Running: {}", test));
        }
    }

    async fn test_failed(&self, test: &TestDescription, trace: &str) {
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .current_failed = true;
        let first_line = trace.lines().next().unwrap_or_default();
        self.println(format!(
            "{} {}\n    {}",
            ::console::style("FAIL").red(),
            test,
            ::console::style(first_line).dim()
        ));
    }

    async fn test_assumption_failure(&self, test: &TestDescription, _trace: &str) {
        self.println(format!("{} {}", ::console::style("SKIP").yellow(), test));
    }

    async fn test_ignored(&self, test: &TestDescription) {
        if self.verbose {
            self.println(format!("{} {}", ::console::style("IGN ").yellow(), test));
        }
    }

    async fn test_ended(&self, test: &TestDescription, _metrics: &Metrics) {
        let failed = {
            let progress = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(bar) = &progress.bar {
                bar.inc(1);
            }
            progress.current_failed
        };
        if self.verbose && !failed {
            self.println(format!("{} {}", ::console::style("PASS").green(), test));
        }
    }

    async fn test_run_failed(&self, message: &str) {
        self.println(format!(
            "{} {}",
            ::console::style("RUN FAILED").red().bold(),
            message
        ));
    }
}
