//! Binary entry point behaviour that needs no broker.

use assert_cmd::Command;
use predicates::prelude::*;

fn gateway() -> Command {
    let mut cmd = Command::cargo_bin("wb-mqtt-opcua").unwrap();
    cmd.env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_help() {
    gateway()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--config"))
        .stdout(predicate::str::contains("--generate"));
}

#[test]
fn test_version() {
    gateway()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("wb-mqtt-opcua"));
}

#[test]
fn test_invalid_debug_level_is_usage_error() {
    gateway().args(["-d", "7"]).assert().code(2);
}

#[test]
fn test_short_h_takes_a_host() {
    gateway().arg("-h").assert().code(2);
}

#[test]
fn test_missing_config_is_not_configured() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.conf");

    gateway()
        .arg("-c")
        .arg(&path)
        .assert()
        .code(6)
        .stdout(predicate::str::contains("FATAL"));
}

#[test]
fn test_invalid_config_is_not_configured() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gw.conf");
    std::fs::write(&path, r#"{ "opcua": { "port": 4840 } }"#).unwrap();

    gateway().arg("-c").arg(&path).assert().code(6);
}

#[test]
fn test_generate_without_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.conf");

    gateway().arg("-g").arg(&path).assert().code(1);
}
