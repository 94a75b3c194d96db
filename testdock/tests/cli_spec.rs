use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;

#[test]
fn top_level_help() {
    let mut cmd = Command::cargo_bin("testdock").unwrap();
    cmd.arg("--help").assert().success();
}

#[test]
fn test_run_help_lists_core_flags() {
    let mut cmd = Command::cargo_bin("testdock").unwrap();
    cmd.args(["test", "run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--auto-compose"))
        .stdout(predicate::str::contains("--parallel"))
        .stdout(predicate::str::contains("--only-prepare"));
}

#[test]
fn version_subcommand_prints_the_package_version() {
    let mut cmd = Command::cargo_bin("testdock").unwrap();
    cmd.arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn compose_without_services_fails_with_guidance() {
    let dir = tempfile::tempdir().unwrap();
    let mut cmd = Command::cargo_bin("testdock").unwrap();
    cmd.current_dir(dir.path())
        .args(["test", "compose", "--auto-compose"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("at least one service"));
}

#[test]
fn compose_generates_a_file_and_prints_its_path() {
    let dir = tempfile::tempdir().unwrap();
    let mut cmd = Command::cargo_bin("testdock").unwrap();
    let assert = cmd
        .current_dir(dir.path())
        .args([
            "test",
            "compose",
            "--auto-compose",
            "--service",
            "redis",
            "--project",
            "testdock-cli-spec",
        ])
        .assert()
        .success();

    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let path = std::path::Path::new(stdout.trim());
    assert!(path.exists(), "compose file should exist: {}", path.display());

    let rendered = std::fs::read_to_string(path).unwrap();
    assert!(rendered.contains("redis:6-alpine"));
    assert!(rendered.contains("tester:"));
    std::fs::remove_file(path).ok();
}

#[test]
fn unknown_service_is_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut cmd = Command::cargo_bin("testdock").unwrap();
    cmd.current_dir(dir.path())
        .args([
            "test",
            "compose",
            "--auto-compose",
            "--service",
            "oracle",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("oracle"));
}

#[test]
fn invalid_extras_json_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut cmd = Command::cargo_bin("testdock").unwrap();
    cmd.current_dir(dir.path())
        .args([
            "test",
            "compose",
            "--auto-compose",
            "--service",
            "redis",
            "--extras",
            "{broken",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("JSON"));
}
