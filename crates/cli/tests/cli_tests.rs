//! CLI integration tests

use std::process::{Command, Output};

fn hubctl(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_hubctl"))
        .args(args)
        .env_remove("HUBCTL_API_URL")
        .env_remove("HUBCTL_TOKEN")
        .output()
        .expect("Failed to execute hubctl")
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = hubctl(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(stdout.contains("Selenium Hub"), "Should show app name");
    assert!(stdout.contains("browsers"), "Should show browsers command");
    assert!(stdout.contains("health"), "Should show health command");
    assert!(stdout.contains("--api-url"), "Should show api-url option");
    assert!(stdout.contains("HUBCTL_API_URL"), "Should show env var");
    assert!(stdout.contains("--token"), "Should show token option");
}

#[test]
fn test_cli_version() {
    let output = hubctl(&["--version"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("hubctl"), "Should show binary name");
}

#[test]
fn test_browsers_create_help() {
    let output = hubctl(&["browsers", "create", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("--type"), "Should show type option");
    assert!(stdout.contains("--count"), "Should show count option");
}

#[test]
fn test_format_option() {
    let output = hubctl(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(stdout.contains("--format"), "Should show format option");
    assert!(stdout.contains("table"), "Should show table format");
    assert!(stdout.contains("json"), "Should show json format");
}

#[test]
fn test_zero_count_is_rejected_locally() {
    let output = hubctl(&["browsers", "create", "--count", "0"]);
    assert!(!output.status.success(), "Zero count should fail");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--count"), "Should name the offending option");
}

#[test]
fn test_delete_requires_ids() {
    let output = hubctl(&["browsers", "delete"]);
    assert!(!output.status.success(), "Missing ids should fail");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("required") || stderr.contains("error"),
        "Should show error about missing argument"
    );
}

#[test]
fn test_invalid_command() {
    let output = hubctl(&["invalid-command"]);
    assert!(!output.status.success(), "Invalid command should fail");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("error") || stderr.contains("invalid"),
        "Should show error message"
    );
}

#[test]
fn test_unreachable_server_fails() {
    let output = hubctl(&["--api-url", "http://127.0.0.1:9", "browsers", "list"]);
    assert!(!output.status.success(), "Unreachable server should fail");
}
