//! Exit codes and output of the `phantom` binary.
//!
//! Only actions that touch nothing but the install directory are run, so
//! these tests never reach real system tools.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn phantom(install: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("phantom").expect("binary");
    for var in [
        "PHANTOM_INSTALL_DIR",
        "PHANTOM_WG_DIR",
        "PHANTOM_TEST",
        "PHANTOM_LOG",
        "PHANTOM_LOG_FORMAT",
        "MULTIHOP_LOG_LEVEL",
    ] {
        cmd.env_remove(var);
    }
    cmd.arg("--install-dir").arg(install.path());
    cmd
}

#[test]
fn health_reports_install_dir() {
    let install = tempfile::tempdir().expect("tempdir");
    phantom(&install)
        .arg("health")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\": \"healthy\""))
        .stdout(predicate::str::contains(install.path().display().to_string()));
}

#[test]
fn modules_lists_every_action() {
    let install = tempfile::tempdir().expect("tempdir");
    phantom(&install)
        .arg("modules")
        .assert()
        .success()
        .stdout(predicate::str::contains("get_session_log"))
        .stdout(predicate::str::contains("change_dns_servers"));
}

#[test]
fn unknown_module_exits_with_two() {
    let install = tempfile::tempdir().expect("tempdir");
    phantom(&install)
        .args(["exec", "reset", "factory_reset"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("UNKNOWN_ACTION"));
}

#[test]
fn malformed_parameter_exits_with_two() {
    let install = tempfile::tempdir().expect("tempdir");
    phantom(&install)
        .args(["exec", "core", "add_client", "alice"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("invalid argument"));
}

#[test]
fn missing_subcommand_exits_with_two() {
    let install = tempfile::tempdir().expect("tempdir");
    phantom(&install).assert().code(2);
}

#[test]
fn invalid_log_format_from_env_exits_with_two() {
    let install = tempfile::tempdir().expect("tempdir");
    phantom(&install)
        .env("PHANTOM_LOG_FORMAT", "xml")
        .arg("health")
        .assert()
        .code(2);
}

#[test]
fn dns_change_persists() {
    let install = tempfile::tempdir().expect("tempdir");
    phantom(&install)
        .args(["exec", "dns", "get_dns_servers"])
        .assert()
        .success()
        .stdout(predicate::str::contains("8.8.8.8"));

    phantom(&install)
        .args(["--compact", "exec", "dns", "change_dns_servers", "primary=9.9.9.9"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("{\"success\":true"));

    let saved = std::fs::read_to_string(install.path().join("config/phantom.json"))
        .expect("phantom.json");
    assert!(saved.contains("9.9.9.9"));
}

#[test]
fn failed_action_exits_with_one() {
    let install = tempfile::tempdir().expect("tempdir");
    phantom(&install)
        .args([
            "exec",
            "core",
            "update_tweak_setting",
            "setting_name=restart_service_after_client_creation",
            "value=\"true\"",
        ])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("VALIDATION_ERROR"));
    assert!(!install.path().join("config/phantom.json").exists());
}

#[test]
fn monitor_exits_when_multihop_is_off() {
    let install = tempfile::tempdir().expect("tempdir");
    phantom(&install)
        .env("MULTIHOP_LOG_LEVEL", "debug")
        .arg("monitor")
        .assert()
        .success();
}
