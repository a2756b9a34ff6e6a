//! CLI Integration Tests
//!
//! These tests run the `keyfob` binary for the commands that need no
//! Bluetooth hardware.
//!
//! ```
//! cargo test --package keyfob-cli --test cli_integration
//! ```

use std::path::Path;
use std::process::{Command, Output};

fn run_keyfob(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_keyfob"))
        .args(args)
        .env_remove("KEYFOB_CONFIG")
        .env_remove("KEYFOB_ADDRESS")
        .env("NO_COLOR", "1")
        .output()
        .expect("Failed to run keyfob binary")
}

fn run_with_config(config: &Path, args: &[&str]) -> Output {
    let mut full = vec!["--config", config.to_str().unwrap()];
    full.extend_from_slice(args);
    run_keyfob(&full)
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_command() {
    let output = run_keyfob(&["--help"]);
    assert!(output.status.success(), "Help should succeed");

    let text = stdout(&output);
    assert!(text.contains("run"), "Help should list run command");
    assert!(text.contains("config"), "Help should list config command");
}

#[test]
fn test_version_command() {
    let output = run_keyfob(&["--version"]);
    assert!(output.status.success(), "Version should succeed");
    assert!(stdout(&output).contains("keyfob"));
}

#[test]
fn test_subcommand_help() {
    for args in [&["run", "--help"][..], &["config", "--help"], &["config", "init", "--help"]] {
        let output = run_keyfob(args);
        assert!(output.status.success(), "{:?} should succeed", args);
        assert!(!stdout(&output).is_empty());
    }
}

// =============================================================================
// Config Commands
// =============================================================================

#[test]
fn test_config_path_honours_flag() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    let output = run_with_config(&path, &["config", "path"]);
    assert!(output.status.success());
    assert_eq!(stdout(&output).trim(), path.display().to_string());
}

#[test]
fn test_config_init_then_show() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keyfob").join("config.toml");

    let output = run_with_config(&path, &["config", "init"]);
    assert!(output.status.success(), "init failed: {}", stderr(&output));
    assert!(path.exists());

    // A second init refuses to overwrite.
    let output = run_with_config(&path, &["config", "init"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("--force"));

    let output = run_with_config(&path, &["config", "init", "--force"]);
    assert!(output.status.success());

    let output = run_with_config(&path, &["config", "show"]);
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("[peripheral]"));
    assert!(text.contains("5C:01:3B:96:DD:56"));
    assert!(text.contains("[proximity]"));
    assert!(text.contains("unlock_threshold_dbm = -88"));
}

#[test]
fn test_config_show_warns_about_invalid_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[proximity]\nwindow = 4\n").unwrap();

    let output = run_with_config(&path, &["config", "show"]);
    assert!(output.status.success());
    assert!(stderr(&output).contains("proximity.window"));
}

#[test]
fn test_run_rejects_invalid_address_before_scanning() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "").unwrap();

    let output = run_keyfob(&["--config", path.to_str().unwrap(), "run", "--address", "nope"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("peripheral.address"));
}

#[test]
fn test_run_rejects_invalid_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[connection]\nsupervisor_tick_secs = 0\n").unwrap();

    let output = run_with_config(&path, &["run"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("connection.supervisor_tick_secs"));
}
