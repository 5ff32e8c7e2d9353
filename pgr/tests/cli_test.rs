//! End-to-end CLI tests
//!
//! Drive the built binary against a fake executor shell script that emits
//! canned status blocks, with config and data dirs isolated per test.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use serial_test::serial;
use tempfile::TempDir;

/// Command with config/data dirs redirected into the temp dir
fn pgr(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("pgr").unwrap();
    cmd.current_dir(dir.path())
        .env("XDG_CONFIG_HOME", dir.path().join("xdg-config"))
        .env("XDG_DATA_HOME", dir.path().join("xdg-data"))
        .env("NO_COLOR", "1");
    cmd
}

fn write_executor(dir: &Path, body: &str) -> String {
    let path = dir.join("fake-agent.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().to_string()
}

fn write_config(dir: &Path, executor: &str) {
    std::fs::write(
        dir.join(".programmator.yml"),
        format!("executor: {}\n", executor),
    )
    .unwrap();
}

#[test]
fn test_config_show_prints_defaults() {
    let dir = TempDir::new().unwrap();
    pgr(&dir)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("max-iterations: 30"))
        .stdout(predicate::str::contains("executor: claude"))
        .stdout(predicate::str::contains("stagnation-limit: 3"));
}

#[test]
fn test_config_show_respects_local_file() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join(".programmator.yml"), "max-iterations: 7\n").unwrap();
    pgr(&dir)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("max-iterations: 7"))
        .stdout(predicate::str::contains("executor: claude"));
}

#[test]
fn test_status_without_session() {
    let dir = TempDir::new().unwrap();
    pgr(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("No active session"));
}

#[test]
fn test_plan_create_scaffolds_file() {
    let dir = TempDir::new().unwrap();
    pgr(&dir)
        .args(["plan", "create", "add caching; wire into api"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Plan created"));

    let plan = std::fs::read_to_string(dir.path().join("plans").join("add-caching-wire-into-api.md")).unwrap();
    assert!(plan.contains("## Status: open"));
    assert!(plan.contains("- [ ] add caching"));
    assert!(plan.contains("- [ ] wire into api"));
}

#[test]
fn test_plan_create_refuses_overwrite() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("plan.md");
    std::fs::write(&output, "existing").unwrap();
    pgr(&dir)
        .args(["plan", "create", "something", "-o"])
        .arg(&output)
        .assert()
        .failure();
}

#[test]
#[serial]
fn test_run_completes_on_done_status() {
    let dir = TempDir::new().unwrap();
    let executor = write_executor(
        dir.path(),
        "echo working\ncat <<'EOF'\nPROGRAMMATOR_STATUS:\n  status: DONE\n  files_changed:\n    - a.rs\n  summary: \"did the task\"\nEOF",
    );
    write_config(dir.path(), &executor);

    pgr(&dir)
        .args(["run", "do the task"])
        .assert()
        .success()
        .stdout(predicate::str::contains("working"))
        .stdout(predicate::str::contains("complete"))
        .stdout(predicate::str::contains("iterations:    1"));
}

#[test]
#[serial]
fn test_stagnation_exit_code() {
    let dir = TempDir::new().unwrap();
    let executor = write_executor(
        dir.path(),
        "cat <<'EOF'\nPROGRAMMATOR_STATUS:\n  status: CONTINUE\n  files_changed: []\n  summary: \"no progress\"\nEOF",
    );
    write_config(dir.path(), &executor);

    pgr(&dir)
        .args(["run", "spin", "--stagnation-limit", "2"])
        .assert()
        .code(3)
        .stdout(predicate::str::contains("stagnation"));
}

#[test]
#[serial]
fn test_blocked_exit_code_and_message() {
    let dir = TempDir::new().unwrap();
    let executor = write_executor(
        dir.path(),
        "cat <<'EOF'\nPROGRAMMATOR_STATUS:\n  status: BLOCKED\n  error: \"missing dep\"\nEOF",
    );
    write_config(dir.path(), &executor);

    pgr(&dir)
        .args(["run", "impossible"])
        .assert()
        .code(4)
        .stdout(predicate::str::contains("missing dep"));
}

#[test]
#[serial]
fn test_max_iterations_exit_code() {
    let dir = TempDir::new().unwrap();
    let executor = write_executor(
        dir.path(),
        "cat <<'EOF'\nPROGRAMMATOR_STATUS:\n  status: CONTINUE\n  files_changed:\n    - a.rs\n  summary: \"one more step\"\nEOF",
    );
    write_config(dir.path(), &executor);

    pgr(&dir)
        .args(["run", "never ends", "--max-iterations", "2", "--stagnation-limit", "0"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("max-iterations"))
        .stdout(predicate::str::contains("iterations:    2"));
}

#[test]
#[serial]
fn test_start_with_plan_file() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("feature.md"),
        "# Feature plan\n\n## Status: open\n\n- [ ] Only phase\n",
    )
    .unwrap();
    let executor = write_executor(
        dir.path(),
        "cat <<'EOF'\nPROGRAMMATOR_STATUS:\n  phase_completed: Only phase\n  status: DONE\n  files_changed:\n    - b.rs\n  summary: \"done\"\nEOF",
    );
    write_config(dir.path(), &executor);

    pgr(&dir).args(["start", "feature.md"]).assert().success();

    let plan = std::fs::read_to_string(dir.path().join("feature.md")).unwrap();
    assert!(plan.contains("- [x] Only phase"));
}

#[test]
fn test_missing_executor_refuses_to_start() {
    let dir = TempDir::new().unwrap();
    write_config(dir.path(), "definitely-not-a-real-binary-xyz");
    pgr(&dir)
        .args(["run", "anything"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_review_without_agents_is_noop() {
    let dir = TempDir::new().unwrap();
    pgr(&dir)
        .arg("review")
        .assert()
        .success()
        .stdout(predicate::str::contains("No review agents configured"));
}

#[test]
fn test_invalid_severity_rejected() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join(".programmator.yml"),
        "review:\n  agents:\n    - name: bugs\n",
    )
    .unwrap();
    pgr(&dir)
        .args(["review", "--severities", "urgent"])
        .assert()
        .failure();
}
