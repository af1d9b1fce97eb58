//! Integration tests for the `coinwall` CLI binary.
//!
//! Every test runs against a throwaway HOME and an explicit config file so
//! the user's real configuration and state are never touched.
#![allow(clippy::unwrap_used)]

use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

// ── Helpers ─────────────────────────────────────────────────────────

/// Build a [`Command`] for the `coinwall` binary with env isolation.
fn coinwall_cmd(home: &Path) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("coinwall");
    cmd.env("HOME", home)
        .env("XDG_CONFIG_HOME", home.join("config"))
        .env("XDG_DATA_HOME", home.join("data"))
        .env_remove("COINWALL_CONFIG")
        .env_remove("COINWALL_OUTPUT")
        .env_remove("COINWALL_SUBVENDO_KEY")
        .env_remove("RUST_LOG");
    cmd
}

/// Write a config with the usual three tiers and a state file in `dir`.
fn write_config(dir: &Path, extra: &str) -> PathBuf {
    let state = dir.join("sessions.json");
    let path = dir.join("config.toml");
    let text = format!(
        r#"
[engine]
state_file = "{}"

[[rates]]
amount = 1
minutes = 15

[[rates]]
amount = 5
minutes = 120
download_speed = 3072
upload_speed = 1024

[[rates]]
amount = 10
minutes = 300
download_speed = 5120
upload_speed = 2048

[[point_rates]]
points = 10
minutes = 30
{extra}
"#,
        state.display()
    );
    std::fs::write(&path, text).unwrap();
    path
}

/// Concatenate stdout + stderr from a command output for flexible matching.
fn combined_output(output: &std::process::Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    format!("{stdout}{stderr}")
}

// ── Basic invocation ────────────────────────────────────────────────

#[test]
fn test_no_args_shows_help() {
    let home = TempDir::new().unwrap();
    let output = coinwall_cmd(home.path()).output().unwrap();
    assert_eq!(output.status.code(), Some(2), "Expected exit code 2");
    let text = combined_output(&output);
    assert!(text.contains("Usage"), "Expected 'Usage' in output:\n{text}");
}

#[test]
fn test_help_lists_commands() {
    let home = TempDir::new().unwrap();
    coinwall_cmd(home.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("hotspot")
                .and(predicate::str::contains("run"))
                .and(predicate::str::contains("quote"))
                .and(predicate::str::contains("sessions")),
        );
}

#[test]
fn test_version_flag() {
    let home = TempDir::new().unwrap();
    coinwall_cmd(home.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("coinwall"));
}

#[test]
fn test_completions_bash() {
    let home = TempDir::new().unwrap();
    coinwall_cmd(home.path())
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty().not());
}

// ── Config ──────────────────────────────────────────────────────────

#[test]
fn test_config_path_honors_flag() {
    let home = TempDir::new().unwrap();
    let path = home.path().join("elsewhere.toml");
    coinwall_cmd(home.path())
        .args(["config", "path", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("elsewhere.toml"));
}

#[test]
fn test_config_init_refuses_to_overwrite() {
    let home = TempDir::new().unwrap();
    let path = home.path().join("config.toml");

    coinwall_cmd(home.path())
        .args(["config", "init", "--config"])
        .arg(&path)
        .assert()
        .success();
    assert!(path.exists());

    let output = coinwall_cmd(home.path())
        .args(["config", "init", "--config"])
        .arg(&path)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(6));

    coinwall_cmd(home.path())
        .args(["config", "init", "--force", "--config"])
        .arg(&path)
        .assert()
        .success();
}

#[test]
fn test_config_show_masks_plaintext_key() {
    let home = TempDir::new().unwrap();
    let path = write_config(home.path(), "\n[coin]\nsubvendo_key = \"hunter2\"\n");
    coinwall_cmd(home.path())
        .args(["config", "show", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("********").and(predicate::str::contains("hunter2").not()));
}

#[test]
fn test_invalid_config_is_a_usage_error() {
    let home = TempDir::new().unwrap();
    let path = write_config(home.path(), "\n[coin]\npulse_value = 0\n");
    let output = coinwall_cmd(home.path())
        .args(["quote", "5", "--config"])
        .arg(&path)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(combined_output(&output).contains("pulse_value"));
}

// ── Rates ───────────────────────────────────────────────────────────

#[test]
fn test_quote_uses_optimal_combination() {
    let home = TempDir::new().unwrap();
    let path = write_config(home.path(), "");
    coinwall_cmd(home.path())
        .args(["quote", "15", "-o", "plain", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout("420\n");
}

#[test]
fn test_quote_json_shows_preview_and_optimal() {
    let home = TempDir::new().unwrap();
    let path = write_config(home.path(), "");
    let output = coinwall_cmd(home.path())
        .args(["quote", "6", "-o", "json", "--config"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["preview"]["minutes"], 135);
    assert_eq!(value["optimal"]["minutes"], 135);
    assert_eq!(value["optimal"]["download_speed"], 3072);
}

#[test]
fn test_rates_table_lists_tiers() {
    let home = TempDir::new().unwrap();
    let path = write_config(home.path(), "");
    coinwall_cmd(home.path())
        .args(["rates", "--color", "never", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("5120/2048 kbps").and(predicate::str::contains("Points")));
}

// ── Sessions ────────────────────────────────────────────────────────

#[test]
fn test_sessions_list_empty_state() {
    let home = TempDir::new().unwrap();
    let path = write_config(home.path(), "");
    coinwall_cmd(home.path())
        .args(["sessions", "list", "-o", "json-compact", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout("[]\n");
}

#[test]
fn test_credit_persists_to_state_file() {
    let home = TempDir::new().unwrap();
    let path = write_config(home.path(), "");

    coinwall_cmd(home.path())
        .args(["sessions", "credit", "AA-BB-CC-DD-EE-01", "--time", "1h", "-q", "--config"])
        .arg(&path)
        .assert()
        .success();
    assert!(home.path().join("sessions.json").exists());

    coinwall_cmd(home.path())
        .args(["sessions", "show", "aa:bb:cc:dd:ee:01", "-o", "plain", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout("3600\n");

    coinwall_cmd(home.path())
        .args(["sessions", "list", "--active", "-o", "plain", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout("aa:bb:cc:dd:ee:01\n");
}

#[test]
fn test_show_unknown_session_is_not_found() {
    let home = TempDir::new().unwrap();
    let path = write_config(home.path(), "");
    let output = coinwall_cmd(home.path())
        .args(["sessions", "show", "aa:bb:cc:dd:ee:09", "--config"])
        .arg(&path)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(4));
    assert!(combined_output(&output).contains("sessions list"));
}

#[test]
fn test_malformed_mac_is_rejected() {
    let home = TempDir::new().unwrap();
    let path = write_config(home.path(), "");
    let output = coinwall_cmd(home.path())
        .args(["sessions", "show", "not-a-mac", "--config"])
        .arg(&path)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_redeem_without_points_is_rejected() {
    let home = TempDir::new().unwrap();
    let path = write_config(home.path(), "");
    coinwall_cmd(home.path())
        .args(["sessions", "credit", "aa:bb:cc:dd:ee:02", "--time", "10m", "-q", "--config"])
        .arg(&path)
        .assert()
        .success();

    let output = coinwall_cmd(home.path())
        .args(["sessions", "redeem", "aa:bb:cc:dd:ee:02", "10", "--config"])
        .arg(&path)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(combined_output(&output).contains("insufficient points"));
}

#[test]
fn test_ephemeral_config_has_no_state_file() {
    let home = TempDir::new().unwrap();
    let path = home.path().join("config.toml");
    std::fs::write(&path, "[engine]\nephemeral = true\n").unwrap();
    let output = coinwall_cmd(home.path())
        .args(["sessions", "list", "--config"])
        .arg(&path)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_sales_ledger_starts_empty() {
    let home = TempDir::new().unwrap();
    let path = write_config(home.path(), "");
    coinwall_cmd(home.path())
        .args(["sales", "-o", "json-compact", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout("[]\n");
}

#[test]
fn test_credit_refused_while_state_file_is_held() {
    let home = TempDir::new().unwrap();
    let path = write_config(home.path(), "");
    let held = coinwall_core::SessionStore::open(home.path().join("sessions.json")).unwrap();

    let output = coinwall_cmd(home.path())
        .args(["sessions", "credit", "aa:bb:cc:dd:ee:03", "--time", "10m", "--config"])
        .arg(&path)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(combined_output(&output).contains("locked"));

    coinwall_cmd(home.path())
        .args(["sessions", "list", "-o", "json-compact", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout("[]\n");

    drop(held);
    coinwall_cmd(home.path())
        .args(["sessions", "credit", "aa:bb:cc:dd:ee:03", "--time", "10m", "-q", "--config"])
        .arg(&path)
        .assert()
        .success();
}

// ── Run ─────────────────────────────────────────────────────────────

#[test]
fn test_run_stops_after_duration() {
    let home = TempDir::new().unwrap();
    let path = write_config(home.path(), "");
    coinwall_cmd(home.path())
        .args(["run", "--duration", "300ms", "--config"])
        .arg(&path)
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .success();
}
