//! Command-line behavior of the `devrun` binary.

use assert_cmd::Command;
use predicates::prelude::*;

fn devrun(dir: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("devrun").unwrap();
    cmd.current_dir(dir);
    cmd
}

const PASSING: &str = r#"
[invocation]
name = "smoke"

[[devices]]
name = "primary"
[devices.target]
type = "local"
working_dir = "."

[[modules]]
name = "core"
[[modules.tests]]
name = "unit"
cases = [{ name = "a", command = "true" }, { name = "b", command = "echo ok" }]
"#;

#[test]
fn test_init_then_validate() {
    let dir = tempfile::tempdir().unwrap();

    devrun(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Created devrun.toml"));
    assert!(dir.path().join("devrun.toml").exists());

    devrun(dir.path())
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid!"));

    devrun(dir.path()).arg("init").assert().failure();
}

#[test]
fn test_validate_rejects_config_without_devices() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("devrun.toml"), "[invocation]\nname = \"x\"\n").unwrap();

    devrun(dir.path())
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn test_run_passing_config_writes_junit() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("devrun.toml"), PASSING).unwrap();

    devrun(dir.path())
        .arg("run")
        .assert()
        .success()
        .stdout(predicate::str::contains("All tests passed!"));

    let junit = std::fs::read_to_string(dir.path().join("devrun-results/junit.xml")).unwrap();
    assert!(junit.contains(r#"name="smoke""#));
    assert!(junit.contains(r#"tests="2""#));
    assert!(dir.path().join("devrun-results/logs/host_log.txt").exists());
}

#[test]
fn test_run_with_failing_case_exits_nonzero() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("devrun.toml"),
        PASSING.replace("echo ok", "false"),
    )
    .unwrap();

    devrun(dir.path())
        .arg("run")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("Some tests failed."));
}

#[test]
fn test_run_sharded_json_summary() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("devrun.toml"), PASSING).unwrap();

    devrun(dir.path())
        .args(["run", "--shard-count", "2", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""passed": 2"#))
        .stdout(predicate::str::contains(r#""invocation_failures": []"#));
}
