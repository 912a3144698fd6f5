//! End-to-end tests for the dispatch-etl binary
//!
//! These cover argument handling and failures that happen before any database work.

use assert_cmd::Command;
use predicates::prelude::*;

fn dispatch_etl() -> Command {
    let mut cmd = Command::cargo_bin("dispatch-etl").unwrap();
    cmd.env_remove("DATABASE_URL")
        .env("LOG_OUTPUT", "stdout")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_help_lists_entry_points() {
    dispatch_etl()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("ingest"))
        .stdout(predicate::str::contains("process"))
        .stdout(predicate::str::contains("convert"))
        .stdout(predicate::str::contains("rollups"))
        .stdout(predicate::str::contains("curate-5min"))
        .stdout(predicate::str::contains("migrate"));
}

#[test]
fn test_invalid_since_is_rejected() {
    dispatch_etl()
        .args(["ingest", "--since", "yesterday"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--since"));
}

#[test]
fn test_unknown_report_is_rejected() {
    dispatch_etl()
        .args(["ingest", "--report", "Trading_IS_Reports"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--report"));
}

#[test]
fn test_missing_database_url_fails() {
    let dir = tempfile::tempdir().unwrap();
    dispatch_etl()
        .current_dir(dir.path())
        .arg("rollups")
        .assert()
        .failure()
        .stderr(predicate::str::contains("DATABASE_URL"));
}
