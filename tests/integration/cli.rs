//! The `ralph` binary.

use assert_cmd::Command;
use chrono::Utc;
use predicates::prelude::*;
use serde_json::json;

use ralph_supervisor::backlog::StoryStatus;
use ralph_supervisor::lock::lock_path_for;

use crate::common::*;

const SETTINGS: &str = r#"
[agent]
command = "echo 'TOUCHED: src/feature.rs'"

[quality]
max_fix_cycles = 0

[[quality.gates]]
name = "check"
command = "true"
"#;

fn ralph() -> Command {
    let mut cmd = Command::cargo_bin("ralph").unwrap();
    cmd.env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_init_config_prints_defaults() {
    ralph()
        .arg("init-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("[workers]"))
        .stdout(predicate::str::contains("max_workers = 1"))
        .stdout(predicate::str::contains("threshold = 7.0"));
}

#[test]
fn test_status_lists_stories() {
    let (dir, path) = write_backlog(vec![story("US-001", 2), story("US-002", 1)]);
    ralph()
        .current_dir(dir.path())
        .args(["status", "--backlog"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Fixture"))
        .stdout(predicate::str::contains("US-001"))
        .stdout(predicate::str::contains("0/2 criteria"));
}

#[test]
fn test_run_executes_backlog_with_command_agent() {
    let (dir, path) = write_backlog(vec![story("US-001", 2)]);
    let settings = dir.path().join("ralph.toml");
    std::fs::write(&settings, SETTINGS).unwrap();

    ralph()
        .current_dir(dir.path())
        .args(["--config"])
        .arg(&settings)
        .args(["run", "--backlog"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("1 passed"));

    let story = load_backlog(&path).story("US-001").unwrap().clone();
    assert_eq!(story.status, StoryStatus::Passed);
    assert!(story.touched_paths.contains("src/feature.rs"));
    assert_eq!(story.gate_results.len(), 1);
}

#[test]
fn test_run_refuses_locked_backlog() {
    let (dir, path) = write_backlog(vec![story("US-001", 1)]);
    let before = std::fs::read_to_string(&path).unwrap();

    let lock = lock_path_for(&path);
    std::fs::create_dir_all(lock.parent().unwrap()).unwrap();
    let holder = json!({
        "pid": std::process::id(),
        "instance": "test-holder",
        "backlog": path,
        "acquiredAt": Utc::now(),
    });
    std::fs::write(&lock, holder.to_string()).unwrap();

    ralph()
        .current_dir(dir.path())
        .args(["run", "--backlog"])
        .arg(&path)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("already running"));

    assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    assert!(lock.exists());
}
