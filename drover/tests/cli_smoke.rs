//! Binary smoke tests: flag parsing, drain/resume files, status rendering.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn drover() -> Command {
    Command::cargo_bin("drover").unwrap()
}

#[test]
fn help_lists_subcommands() {
    drover()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("drain"))
        .stdout(predicate::str::contains("resume"));
}

#[test]
fn version_prints() {
    drover()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("drover"));
}

#[test]
fn drain_creates_signal_file() {
    let dir = TempDir::new().unwrap();
    drover()
        .args(["--dir", dir.path().to_str().unwrap(), "drain"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Drain signal sent"));
    assert!(dir.path().join("drain").exists());
}

#[test]
fn resume_clears_signal_file() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("drain"), "").unwrap();
    drover()
        .args(["--dir", dir.path().to_str().unwrap(), "resume"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Drain signal cleared"));
    assert!(!dir.path().join("drain").exists());
}

#[test]
fn resume_without_drain_still_succeeds() {
    let dir = TempDir::new().unwrap();
    drover()
        .args(["--dir", dir.path().to_str().unwrap(), "resume"])
        .assert()
        .success();
}

#[test]
fn status_renders_empty_state() {
    let dir = TempDir::new().unwrap();
    drover()
        .args(["--dir", dir.path().to_str().unwrap(), "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("TASKS (0)"))
        .stdout(predicate::str::contains("WORKERS (0)"))
        .stdout(predicate::str::contains("WORKSPACES (0)"));
}

#[test]
fn dir_flag_respected_via_env() {
    let dir = TempDir::new().unwrap();
    drover()
        .env("DROVER_DIR", dir.path())
        .arg("drain")
        .assert()
        .success();
    assert!(dir.path().join("drain").exists());
}

#[test]
fn run_without_board_id_fails_cleanly() {
    let dir = TempDir::new().unwrap();
    drover()
        .args(["--dir", dir.path().to_str().unwrap(), "run", "--once"])
        .env("GH_TOKEN", "test-token")
        .assert()
        .failure()
        .stderr(predicate::str::contains("board_id"));
}
