//! End-to-end invocation scenarios driven through the public API.

use std::collections::HashSet;
use std::sync::Arc;

use devrun::command::execute_command;
use devrun::config::load_config_str;
use devrun::invocation::{
    Configuration, InvocationStatus, NoopRescheduler, QueueRescheduler, TestInvocation,
};
use devrun::listener::{CollectingListener, InvocationEvent};
use devrun::logging::HostLog;
use devrun::result::TestStatus;
use devrun::suite::PREPARATION_ERROR_TEST;
use devrun::InvocationContext;

fn configuration(toml: &str) -> (Configuration, Arc<CollectingListener>) {
    let config = load_config_str(toml).unwrap();
    let collector = Arc::new(CollectingListener::new());
    let configuration = Configuration::from_config(&config)
        .unwrap()
        .with_listener(collector.clone());
    (configuration, collector)
}

#[tokio::test]
async fn test_happy_path_single_invocation() {
    let (configuration, collector) = configuration(
        r#"
        [[devices]]
        name = "primary"
        [devices.target]
        type = "stub"

        [[modules]]
        name = "core"
        [[modules.tests]]
        name = "unit"
        cases = [{ name = "a", command = "true" }, { name = "b", command = "true" }]
        "#,
    );
    let mut context = InvocationContext::new("cfg");
    let mut invocation = TestInvocation::new(HostLog::new());

    invocation
        .invoke(&mut context, &configuration, &NoopRescheduler)
        .await
        .unwrap();

    assert_eq!(invocation.status(), InvocationStatus::Success);
    assert_eq!(collector.invocation_started_count(), 1);
    assert_eq!(collector.ended_invocations().len(), 1);
    assert_eq!(
        collector.count(|e| matches!(e, InvocationEvent::ModuleStarted(_))),
        1
    );
    let runs = collector.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].name(), "core");
    assert_eq!(runs[0].num_tests_in_state(TestStatus::Passed), 2);
    assert!(!runs[0].is_run_failure());
}

#[tokio::test]
async fn test_failing_local_preparer_is_reported_and_next_module_runs() {
    let dir = tempfile::tempdir().unwrap();
    let (configuration, collector) = configuration(&format!(
        r#"
        [[devices]]
        name = "primary"
        [devices.target]
        type = "local"
        working_dir = "{}"

        [[modules]]
        name = "broken"
        [[modules.preparers]]
        name = "install"
        setup = ["false"]
        [[modules.tests]]
        name = "unit"
        cases = [{{ name = "a", command = "true" }}]

        [[modules]]
        name = "healthy"
        [[modules.tests]]
        name = "unit"
        cases = [{{ name = "a", command = "true" }}]
        "#,
        dir.path().display()
    ));
    let mut invocation = TestInvocation::new(HostLog::new());

    invocation
        .invoke(
            &mut InvocationContext::new("cfg"),
            &configuration,
            &NoopRescheduler,
        )
        .await
        .unwrap();

    let runs = collector.runs();
    assert_eq!(runs.len(), 2);
    let broken = &runs[0];
    assert_eq!(broken.name(), "broken");
    assert!(broken.is_run_failure());
    assert_eq!(broken.tests()[0].0.test_name, PREPARATION_ERROR_TEST);
    assert_eq!(broken.tests()[0].1.status, TestStatus::Failure);

    let healthy = &runs[1];
    assert_eq!(healthy.num_tests_in_state(TestStatus::Passed), 1);
    assert_eq!(collector.ended_invocations().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dynamic_shards_share_the_pool() {
    let (configuration, collector) = configuration(
        r#"
        [invocation]
        shard_count = 2
        dynamic_modules = true

        [[devices]]
        name = "primary"
        [devices.target]
        type = "stub"

        [[modules]]
        name = "core"
        not_shardable = true
        [[modules.tests]]
        name = "u0"
        cases = [{ name = "c", command = "true" }]
        [[modules.tests]]
        name = "u1"
        cases = [{ name = "c", command = "true" }]
        [[modules.tests]]
        name = "u2"
        cases = [{ name = "c", command = "true" }]
        [[modules.tests]]
        name = "u3"
        cases = [{ name = "c", command = "true" }]
        "#,
    );

    let outcome = execute_command(&configuration, &HostLog::new()).await;

    assert_eq!(outcome.status, InvocationStatus::Success);
    assert_eq!(outcome.rescheduled_invocations, 2);
    assert_eq!(collector.invocation_started_count(), 1);
    assert_eq!(collector.ended_invocations().len(), 1);

    let runs = collector.runs();
    assert_eq!(runs.len(), 2);
    let executed: Vec<String> = runs
        .iter()
        .flat_map(|r| r.tests().iter().map(|(t, _)| t.class_name.clone()))
        .collect();
    let unique: HashSet<&String> = executed.iter().collect();
    assert_eq!(executed.len(), 4);
    assert_eq!(unique.len(), 4);

    let logs = collector.log_names();
    assert!(logs.contains(&"host_log_shard0".to_string()));
    assert!(logs.contains(&"host_log_shard1".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lost_device_resumes_into_one_reported_invocation() {
    let dir = tempfile::tempdir().unwrap();
    let work = dir.path().join("work");
    std::fs::create_dir(&work).unwrap();
    let (configuration, collector) = configuration(&format!(
        r#"
        [invocation]
        max_command_retries = 2

        [[devices]]
        name = "primary"
        [devices.target]
        type = "local"
        working_dir = "{work}"

        [[tests]]
        name = "soak"
        resumable = true
        cases = [
          {{ name = "first", command = "true" }},
          {{ name = "unplug", command = "sh -c 'mv {work} {work}.gone'" }},
          {{ name = "third", command = "true" }},
        ]
        "#,
        work = work.display()
    ));

    let outcome = execute_command(&configuration, &HostLog::new()).await;

    assert!(outcome.rescheduled_invocations >= 1);
    assert_eq!(collector.invocation_started_count(), 1);
    assert_eq!(collector.ended_invocations().len(), 1);
    assert_eq!(outcome.status, InvocationStatus::DeviceUnavailable);
}

#[tokio::test]
async fn test_missing_build_reschedules_the_command() {
    let (configuration, collector) = configuration(
        r#"
        [[devices]]
        name = "primary"
        [devices.target]
        type = "stub"
        [devices.build]
        build_id = "pending"
        available = false
        "#,
    );
    let rescheduler = QueueRescheduler::new();
    let mut invocation = TestInvocation::new(HostLog::new());

    invocation
        .invoke(&mut InvocationContext::new("cfg"), &configuration, &rescheduler)
        .await
        .unwrap();

    assert_eq!(invocation.status(), InvocationStatus::NoBuild);
    assert_eq!(rescheduler.take_retry_requests(), 1);
    assert!(collector.events().is_empty());
}

#[tokio::test]
async fn test_battery_levels_are_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let (configuration, _collector) = configuration(&format!(
        r#"
        [[devices]]
        name = "primary"
        [devices.target]
        type = "local"
        working_dir = "{}"
        battery_level = 87
        "#,
        dir.path().display()
    ));
    let mut context = InvocationContext::new("cfg");
    let mut invocation = TestInvocation::new(HostLog::new());

    invocation
        .invoke(&mut context, &configuration, &NoopRescheduler)
        .await
        .unwrap();

    assert_eq!(context.attributes("primary-battery-initial"), ["87"]);
    assert_eq!(context.attributes("primary-battery-final"), ["87"]);
}
