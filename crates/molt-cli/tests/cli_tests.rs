//! CLI integration tests for molt.
//!
//! These tests verify command-line argument parsing, help output, and exit
//! codes for error conditions that surface before any database connection.

use assert_cmd::Command;
use predicates::prelude::*;

/// Get a command for the molt binary.
fn cmd() -> Command {
    Command::cargo_bin("molt").unwrap()
}

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("fetch"))
        .stdout(predicate::str::contains("verify"))
        .stdout(predicate::str::contains("escape-password"));
}

#[test]
fn test_fetch_subcommand_help() {
    cmd()
        .args(["fetch", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--direct-copy"))
        .stdout(predicate::str::contains("--s3-bucket"))
        .stdout(predicate::str::contains("--gcp-bucket"))
        .stdout(predicate::str::contains("--local-path"))
        .stdout(predicate::str::contains("--compression"))
        .stdout(predicate::str::contains("--row-batch-size"));
}

#[test]
fn test_verify_subcommand_help() {
    cmd()
        .args(["verify", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--continuous"))
        .stdout(predicate::str::contains("--live"))
        .stdout(predicate::str::contains("--rows-per-second"));
}

#[test]
fn test_hidden_flags_are_not_advertised() {
    cmd()
        .args(["verify", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--fixup").not())
        .stdout(predicate::str::contains("--table-splits").not());
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("molt"));
}

#[test]
fn test_escape_password() {
    cmd()
        .args(["escape-password", "a!b@c"])
        .assert()
        .success()
        .stdout(predicate::str::contains("a%21b%40c"));
}

#[test]
fn test_fetch_requires_source_and_target() {
    cmd()
        .arg("fetch")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--source"));
}

#[test]
fn test_fetch_rejects_unknown_compression() {
    cmd()
        .args([
            "fetch",
            "--source",
            "postgres://localhost:5432/db",
            "--target",
            "postgres://localhost:26257/db",
            "--compression",
            "zip",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("compression"));
}

#[test]
fn test_verify_rejects_bad_duration() {
    cmd()
        .args([
            "verify",
            "--source",
            "postgres://localhost:5432/db",
            "--target",
            "postgres://localhost:26257/db",
            "--continuous-pause-between-runs",
            "soon",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("duration"));
}
