//! CLI integration tests.
//!
//! Tests:
//! - Help and version output
//! - enqueue, fetch and stats against a temporary database

mod common;

use common::TestFixture;
use serde_json::Value;
use std::process::{Command, Output};

fn kiln(fixture: &TestFixture, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_kiln"))
        .args(["--database", fixture.db_path_str(), "--output", "json"])
        .args(args)
        .env_remove("RUST_LOG")
        .env_remove("KILN_DATABASE")
        .output()
        .expect("failed to run kiln")
}

fn json_output(output: &Output) -> Value {
    assert!(
        output.status.success(),
        "kiln failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout.lines().last().expect("no output");
    serde_json::from_str(line).expect("output is not JSON")
}

/// `--help` should list the storage options and subcommands.
#[test]
fn test_cli_help_output() {
    let output = Command::new(env!("CARGO_BIN_EXE_kiln"))
        .arg("--help")
        .output()
        .expect("failed to run");

    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(
        stdout.contains("--database"),
        "help should mention --database option"
    );
    assert!(
        stdout.contains("--log-level"),
        "help should mention --log-level option"
    );
    for command in ["init", "enqueue", "fetch", "stats", "sweep", "run"] {
        assert!(stdout.contains(command), "help should mention {command}");
    }
}

/// `--version` should show the crate version.
#[test]
fn test_cli_version_output() {
    let output = Command::new(env!("CARGO_BIN_EXE_kiln"))
        .arg("--version")
        .output()
        .expect("failed to run");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains(env!("CARGO_PKG_VERSION")),
        "version output should contain {}",
        env!("CARGO_PKG_VERSION")
    );
}

#[test]
fn test_cli_enqueue_fetch_roundtrip() {
    let fixture = TestFixture::new();

    json_output(&kiln(&fixture, &["init"]));
    assert!(fixture.db_path.exists());

    let enqueued = json_output(&kiln(
        &fixture,
        &["enqueue", "--queue", "critical", r#"{"type":"Email"}"#],
    ));
    let job_id = enqueued["job_id"].as_i64().expect("job id");

    let stats = json_output(&kiln(&fixture, &["stats"]));
    assert_eq!(stats["queues"][0]["queue"], "critical");
    assert_eq!(stats["queues"][0]["enqueued"], 1);
    assert_eq!(stats["states"]["Enqueued"], 1);

    let fetched = json_output(&kiln(
        &fixture,
        &["fetch", "--queue", "critical", "--ack", "--timeout-secs", "1"],
    ));
    assert_eq!(fetched["job_id"].as_i64(), Some(job_id));
    assert_eq!(fetched["payload"]["type"], "Email");

    let empty = json_output(&kiln(
        &fixture,
        &["fetch", "--queue", "critical", "--timeout-secs", "1"],
    ));
    assert!(empty["job_id"].is_null());
}

#[test]
fn test_cli_rejects_invalid_payload() {
    let fixture = TestFixture::new();
    let output = kiln(&fixture, &["enqueue", "not json"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("payload must be valid JSON"));
}
