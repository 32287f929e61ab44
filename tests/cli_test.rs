//! CLI tests for the dispatchd binary
//!
//! Each test points the binary at a config whose SQLite store lives in a
//! temp dir, and keeps logs out of the real home directory.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

struct Env {
    dir: TempDir,
}

impl Env {
    fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = format!(
            r#"
storage:
  backend: sqlite
  path: {}
transport:
  kind: dry-run
identities:
  - identity-id: bot-a
    rate-limit-capacity: 5
    refill-interval-ms: 60000
    max-attempts: 3
    backoff-base-ms: 1000
    backoff-cap-ms: 60000
"#,
            dir.path().join("state.db").display()
        );
        fs::write(dir.path().join("dispatchd.yml"), config).expect("Failed to write config");
        Self { dir }
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("dispatchd").expect("binary built");
        cmd.env("HOME", self.dir.path())
            .env("XDG_DATA_HOME", self.dir.path().join("data"))
            .env("XDG_CONFIG_HOME", self.dir.path().join("config"))
            .arg("--config")
            .arg(self.dir.path().join("dispatchd.yml"));
        cmd
    }
}

#[test]
fn test_help_lists_commands() {
    let mut cmd = Command::cargo_bin("dispatchd").expect("binary built");
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("enqueue"))
        .stdout(predicate::str::contains("dead-letters"));
}

#[test]
fn test_enqueue_then_inspect() {
    let env = Env::new();

    env.cmd()
        .args(["enqueue", "bot-a", "chat-1", "hello", "--id", "m1", "--delay-ms", "600000"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Enqueued").and(predicate::str::contains("m1")));

    env.cmd()
        .args(["enqueue", "bot-a", "chat-1", "hello", "--id", "m1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Already enqueued"));

    env.cmd()
        .args(["inspect", "bot-a", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"pending_count\": 1"))
        .stdout(predicate::str::contains("\"paused\": false"));
}

#[test]
fn test_enqueue_priority_and_repeat() {
    let env = Env::new();

    env.cmd()
        .args([
            "enqueue",
            "bot-a",
            "chat-1",
            "digest",
            "--id",
            "d1",
            "--delay-ms",
            "600000",
            "--priority",
            "urgent",
            "--repeat-every-ms",
            "3600000",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("[urgent]"))
        .stdout(predicate::str::contains("repeating every 3600000 ms"));

    env.cmd()
        .args(["enqueue", "bot-a", "chat-1", "x", "--priority", "critical"])
        .assert()
        .failure();
}

#[test]
fn test_invalid_identity_limits_fail_every_command() {
    let env = Env::new();
    let bad = env.dir.path().join("zero.yml");
    fs::write(
        &bad,
        "transport:\n  kind: dry-run\nidentities:\n  - identity-id: bot-a\n    rate-limit-capacity: 0\n    refill-interval-ms: 1000\n    max-attempts: 3\n    backoff-base-ms: 100\n    backoff-cap-ms: 1000\n",
    )
    .unwrap();

    let mut cmd = Command::cargo_bin("dispatchd").expect("binary built");
    cmd.env("HOME", env.dir.path())
        .env("XDG_DATA_HOME", env.dir.path().join("data"))
        .arg("--config")
        .arg(&bad)
        .args(["pause", "bot-a"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("rate-limit-capacity"));
}

#[test]
fn test_pause_shows_in_inspect() {
    let env = Env::new();

    env.cmd().args(["pause", "bot-a"]).assert().success();
    env.cmd()
        .args(["inspect", "bot-a"])
        .assert()
        .success()
        .stdout(predicate::str::contains("paused"));

    env.cmd().args(["resume", "bot-a"]).assert().success();
    env.cmd()
        .args(["inspect", "bot-a", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"paused\": false"));
}

#[test]
fn test_cancel_pending_and_missing() {
    let env = Env::new();

    env.cmd()
        .args(["enqueue", "bot-a", "chat-1", "later", "--id", "m1", "--delay-ms", "600000"])
        .assert()
        .success();

    env.cmd()
        .args(["cancel", "m1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Cancelled"));

    env.cmd()
        .args(["cancel", "m1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("already cancelled"));

    env.cmd().args(["cancel", "nope"]).assert().failure();
}

#[test]
fn test_dead_letters_empty() {
    let env = Env::new();

    env.cmd()
        .args(["dead-letters", "bot-a"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No dead letters"));

    env.cmd()
        .args(["dead-letters", "bot-a", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[]"));
}

#[test]
fn test_invalid_config_fails() {
    let env = Env::new();
    let bad = env.dir.path().join("bad.yml");
    fs::write(&bad, "identities:\n  - identity-id: bot-a\n").unwrap();

    let mut cmd = Command::cargo_bin("dispatchd").expect("binary built");
    cmd.env("HOME", env.dir.path())
        .env("XDG_DATA_HOME", env.dir.path().join("data"))
        .args(["--config"])
        .arg(&bad)
        .args(["inspect", "bot-a"])
        .assert()
        .failure();
}
