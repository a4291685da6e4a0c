//! CLI test cases.

use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    Command::cargo_bin("docsight").unwrap()
}

#[test]
fn test_help() {
    cmd().arg("--help").assert().success();
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}

#[test]
fn test_schema_response() {
    cmd()
        .arg("schema")
        .arg("response")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"$schema\""));
}

#[test]
fn test_schema_job() {
    cmd()
        .arg("schema")
        .arg("job")
        .assert()
        .success()
        .stdout(predicate::str::contains("QUEUED"));
}

#[test]
fn test_recon_status_requires_api_key() {
    cmd()
        .arg("recon-status")
        .env_remove("OCR_API_KEY")
        .env("ENVIRONMENT", "development")
        .assert()
        .failure()
        .stderr(predicate::str::contains("OCR_API_KEY"));
}

#[test]
fn test_recon_status_with_api_key() {
    cmd()
        .arg("recon-status")
        .env("OCR_API_KEY", "test-secret")
        .env("ENVIRONMENT", "development")
        .assert()
        .success()
        .stdout(predicate::str::contains("package_installed"));
}
