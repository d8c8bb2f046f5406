//! JUnit XML report generation.
//!
//! Each test run of the invocation becomes one `<testsuite>`; the file is
//! written when the invocation ends, so a sharded invocation produces a
//! single report covering every shard.
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites name="nightly" tests="2" failures="1" errors="0" time="1.234">
//!   <testsuite name="core" tests="2" failures="1" errors="0" skipped="0" time="1.234">
//!     <testcase classname="unit" name="a" time="0.100"/>
//!     <testcase classname="unit" name="b" time="0.150">
//!       <failure message="exit code 1" type="TestFailure">exit code 1</failure>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use crate::context::InvocationContext;
use crate::error::FailureDescription;
use crate::listener::{CollectingListener, TestListener};
use crate::result::{Metrics, TestDescription, TestResult, TestRunResult, TestStatus};

/// Listener that writes a JUnit XML file when the invocation ends.
///
/// Parent directories are created automatically.
pub struct JunitReporter {
    output_path: PathBuf,
    name: String,
    collected: CollectingListener,
}

impl JunitReporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self {
            output_path,
            name: "devrun".to_string(),
            collected: CollectingListener::new(),
        }
    }

    /// Sets the `name` attribute of `<testsuites>`.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn output_path(&self) -> &PathBuf {
        &self.output_path
    }

    fn generate_xml(&self, elapsed: Duration) -> anyhow::Result<String> {
        let runs = self.collected.runs();
        let failures_at_invocation = self.collected.invocation_failures();
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let tests: usize = runs.iter().map(TestRunResult::num_tests).sum();
        let failures: usize = runs
            .iter()
            .map(|r| r.num_tests_in_state(TestStatus::Failure))
            .sum();
        let errors = runs
            .iter()
            .map(|r| r.num_tests_in_state(TestStatus::Incomplete) + usize::from(r.is_run_failure()))
            .sum::<usize>()
            + failures_at_invocation.len();

        let mut testsuites = BytesStart::new("testsuites");
        testsuites.push_attribute(("name", self.name.as_str()));
        testsuites.push_attribute(("tests", tests.to_string().as_str()));
        testsuites.push_attribute(("failures", failures.to_string().as_str()));
        testsuites.push_attribute(("errors", errors.to_string().as_str()));
        testsuites.push_attribute(("time", format!("{:.3}", elapsed.as_secs_f64()).as_str()));
        writer.write_event(Event::Start(testsuites))?;

        for run in &runs {
            write_testsuite(&mut writer, run)?;
        }

        if !failures_at_invocation.is_empty() {
            write_invocation_failures(&mut writer, &self.name, &failures_at_invocation)?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

        Ok(String::from_utf8(writer.into_inner())?)
    }

    fn write_report(&self, elapsed: Duration) {
        let xml = match self.generate_xml(elapsed) {
            Ok(xml) => xml,
            Err(e) => {
                tracing::error!("Failed to generate JUnit XML: {}", e);
                return;
            }
        };

        if let Some(parent) = self.output_path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            tracing::error!("Failed to create output directory: {}", e);
            return;
        }

        if let Err(e) = std::fs::write(&self.output_path, xml) {
            tracing::error!("Failed to write JUnit XML: {}", e);
        } else {
            tracing::info!("JUnit XML written to: {}", self.output_path.display());
        }
    }
}

fn write_testsuite<W: std::io::Write>(
    writer: &mut Writer<W>,
    run: &TestRunResult,
) -> anyhow::Result<()> {
    let mut testsuite = BytesStart::new("testsuite");
    testsuite.push_attribute(("name", run.name()));
    testsuite.push_attribute(("tests", run.num_tests().to_string().as_str()));
    testsuite.push_attribute((
        "failures",
        run.num_tests_in_state(TestStatus::Failure).to_string().as_str(),
    ));
    testsuite.push_attribute((
        "errors",
        (run.num_tests_in_state(TestStatus::Incomplete) + usize::from(run.is_run_failure()))
            .to_string()
            .as_str(),
    ));
    testsuite.push_attribute((
        "skipped",
        (run.num_tests_in_state(TestStatus::Ignored)
            + run.num_tests_in_state(TestStatus::AssumptionFailure))
        .to_string()
        .as_str(),
    ));
    testsuite.push_attribute(("time", format!("{:.3}", run.elapsed().as_secs_f64()).as_str()));
    writer.write_event(Event::Start(testsuite))?;

    for (test, result) in run.tests() {
        write_testcase(writer, test, result)?;
    }

    if run.is_run_failure() {
        let mut error = BytesStart::new("system-err");
        error.push_attribute(("run-failure", "true"));
        writer.write_event(Event::Start(error))?;
        writer.write_event(Event::Text(BytesText::new(&escape_xml(
            &run.run_failures().join("\n"),
        ))))?;
        writer.write_event(Event::End(BytesEnd::new("system-err")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
    Ok(())
}

fn write_testcase<W: std::io::Write>(
    writer: &mut Writer<W>,
    test: &TestDescription,
    result: &TestResult,
) -> anyhow::Result<()> {
    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", test.class_name.as_str()));
    testcase.push_attribute(("name", test.test_name.as_str()));
    testcase.push_attribute(("time", format!("{:.3}", result.elapsed.as_secs_f64()).as_str()));

    let (element, kind) = match result.status {
        TestStatus::Passed => {
            writer.write_event(Event::Empty(testcase))?;
            return Ok(());
        }
        TestStatus::Failure => ("failure", "TestFailure"),
        TestStatus::Incomplete => ("error", "Incomplete"),
        TestStatus::Ignored | TestStatus::AssumptionFailure => {
            writer.write_event(Event::Start(testcase))?;
            writer.write_event(Event::Empty(BytesStart::new("skipped")))?;
            writer.write_event(Event::End(BytesEnd::new("testcase")))?;
            return Ok(());
        }
    };

    writer.write_event(Event::Start(testcase))?;
    let trace = result.stack_trace.as_deref().unwrap_or("test did not finish");
    let mut failure = BytesStart::new(element);
    let message = escape_xml(trace.lines().next().unwrap_or_default());
    failure.push_attribute(("message", message.as_str()));
    failure.push_attribute(("type", kind));
    writer.write_event(Event::Start(failure))?;
    writer.write_event(Event::Text(BytesText::new(&escape_xml(trace))))?;
    writer.write_event(Event::End(BytesEnd::new(element)))?;
    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    Ok(())
}

fn write_invocation_failures<W: std::io::Write>(
    writer: &mut Writer<W>,
    name: &str,
    failures: &[FailureDescription],
) -> anyhow::Result<()> {
    let mut testsuite = BytesStart::new("testsuite");
    testsuite.push_attribute(("name", format!("{}-invocation", name).as_str()));
    testsuite.push_attribute(("tests", failures.len().to_string().as_str()));
    testsuite.push_attribute(("failures", "0"));
    testsuite.push_attribute(("errors", failures.len().to_string().as_str()));
    writer.write_event(Event::Start(testsuite))?;
    for (index, failure) in failures.iter().enumerate() {
        let mut testcase = BytesStart::new("testcase");
        testcase.push_attribute(("classname", name));
        testcase.push_attribute(("name", format!("invocation-failure-{}", index).as_str()));
        writer.write_event(Event::Start(testcase))?;
        let mut error = BytesStart::new("error");
        let message = escape_xml(&failure.message);
        error.push_attribute(("message", message.as_str()));
        error.push_attribute(("type", format!("{:?}", failure.category).as_str()));
        writer.write_event(Event::Empty(error))?;
        writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    }
    writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
    Ok(())
}

/// Removes characters XML 1.0 cannot carry. quick-xml escapes markup.
fn escape_xml(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}'))
        .collect()
}

#[async_trait]
impl TestListener for JunitReporter {
    async fn invocation_started(&self, context: &InvocationContext) {
        self.collected.invocation_started(context).await;
    }

    async fn invocation_failed(&self, failure: &FailureDescription) {
        self.collected.invocation_failed(failure).await;
    }

    async fn invocation_ended(&self, elapsed: Duration) {
        self.collected.invocation_ended(elapsed).await;
        self.write_report(elapsed);
    }

    async fn test_run_started(&self, run_name: &str, test_count: usize) {
        self.collected.test_run_started(run_name, test_count).await;
    }

    async fn test_started(&self, test: &TestDescription) {
        self.collected.test_started(test).await;
    }

    async fn test_failed(&self, test: &TestDescription, trace: &str) {
        self.collected.test_failed(test, trace).await;
    }

    async fn test_assumption_failure(&self, test: &TestDescription, trace: &str) {
        self.collected.test_assumption_failure(test, trace).await;
    }

    async fn test_ignored(&self, test: &TestDescription) {
        self.collected.test_ignored(test).await;
    }

    async fn test_ended(&self, test: &TestDescription, metrics: &Metrics) {
        self.collected.test_ended(test, metrics).await;
    }

    async fn test_run_failed(&self, message: &str) {
        self.collected.test_run_failed(message).await;
    }

    async fn test_run_ended(&self, elapsed: Duration, metrics: &Metrics) {
        self.collected.test_run_ended(elapsed, metrics).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_xml_drops_control_characters() {
        assert_eq!(escape_xml("ok\u{1}\tdone"), "ok\tdone");
        assert_eq!(escape_xml("<kept>"), "<kept>");
    }

    #[tokio::test]
    async fn test_writes_report_on_invocation_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("junit.xml");
        let reporter = JunitReporter::new(path.clone()).with_name("nightly");

        let pass = TestDescription::new("unit", "a");
        let fail = TestDescription::new("unit", "b");
        reporter.test_run_started("core", 2).await;
        reporter.test_started(&pass).await;
        reporter.test_ended(&pass, &Metrics::new()).await;
        reporter.test_started(&fail).await;
        reporter.test_failed(&fail, "exit code 1 & more").await;
        reporter.test_ended(&fail, &Metrics::new()).await;
        reporter.test_run_ended(Duration::from_millis(5), &Metrics::new()).await;
        assert!(!path.exists());

        reporter.invocation_ended(Duration::from_secs(1)).await;

        let xml = std::fs::read_to_string(&path).unwrap();
        assert!(xml.contains(r#"<testsuites name="nightly" tests="2" failures="1" errors="0""#));
        assert!(xml.contains(r#"<testsuite name="core""#));
        assert!(xml.contains(r#"<testcase classname="unit" name="a""#));
        assert!(xml.contains("exit code 1 &amp; more"));
    }

    #[tokio::test]
    async fn test_invocation_failure_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = JunitReporter::new(dir.path().join("junit.xml"));
        reporter
            .invocation_failed(&FailureDescription::new(
                "flash failed",
                crate::error::FailureCategory::TargetSetup,
            ))
            .await;
        reporter.invocation_ended(Duration::ZERO).await;

        let xml = std::fs::read_to_string(reporter.output_path()).unwrap();
        assert!(xml.contains(r#"errors="1""#));
        assert!(xml.contains("flash failed"));
    }
}
