//! Tests for the `provision` binary

use super::common::{provision_command, write_config, write_find_links};
use assert_cmd::Command as AssertCommand;
use assert_fs::prelude::*;
use assert_fs::TempDir as AssertTempDir;
use predicates::prelude::*;
use provision::ledger::{read_records, InstallStatus, LEDGER_FILE};
use provision::orchestrator::lock::{RunLock, LOCK_FILE};
use provision::orchestrator::RunReport;
use std::fs;
use tempfile::TempDir;

const MANIFEST: &str = "\
[global]
pytest==7.4.0

[wheelhouse]
pandas==2.2.1

[local]
myapp-cli==1.2.0
";

fn provision() -> AssertCommand {
    AssertCommand::from_std(provision_command())
}

/// Offline fixture: find-links directory, config file and manifest.
fn fixture() -> AssertTempDir {
    let temp = AssertTempDir::new().unwrap();
    let links = temp.path().join("links");
    write_find_links(
        &links,
        &[
            ("pytest", "7.4.0", ""),
            ("numpy", "1.26.4", ""),
            ("pandas", "2.2.1", "numpy>=1.22"),
            ("myapp-cli", "1.2.0", "pandas>=2.0, pytest>=7"),
        ],
    );
    write_config(temp.path(), &links);
    temp.child("tiers.txt").write_str(MANIFEST).unwrap();
    temp
}

fn run_args(temp: &AssertTempDir) -> Vec<String> {
    let path = |p: &str| temp.path().join(p).to_string_lossy().into_owned();
    vec![
        "--manifest".to_string(),
        path("tiers.txt"),
        "--config".to_string(),
        path("config.yaml"),
        "--cache-dir".to_string(),
        path("cache"),
        "--state-dir".to_string(),
        path("state"),
        "--offline".to_string(),
    ]
}

#[test]
fn test_help_lists_flags() {
    provision()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--manifest"))
        .stdout(predicate::str::contains("--dry-run"))
        .stdout(predicate::str::contains("--offline"));
}

#[test]
fn test_unknown_tier_is_rejected() {
    provision()
        .args(["--manifest", "tiers.txt", "--tier", "everything"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("everything"));
}

#[test]
fn test_manifest_error_exits_with_code_1() {
    let temp = TempDir::new().unwrap();
    let manifest = temp.path().join("tiers.txt");
    fs::write(&manifest, "[global]\n!!!bad\n").unwrap();

    let output = provision_command()
        .arg("--manifest")
        .arg(&manifest)
        .arg("--state-dir")
        .arg(temp.path().join("state"))
        .arg("--cache-dir")
        .arg(temp.path().join("cache"))
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("line 2"), "stderr: {}", stderr);
    // Nothing ran, so nothing was recorded
    assert!(!temp.path().join("state").join(LEDGER_FILE).exists());
}

#[test]
fn test_missing_manifest_exits_with_code_1() {
    let temp = TempDir::new().unwrap();

    provision()
        .arg("--manifest")
        .arg(temp.path().join("nope.txt"))
        .arg("--state-dir")
        .arg(temp.path().join("state"))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("manifest not found"));
}

#[test]
fn test_dry_run_prints_plan_without_installing() {
    let temp = fixture();

    provision()
        .args(run_args(&temp))
        .arg("--dry-run")
        .assert()
        .success()
        .stdout(predicate::str::contains("Dry run"))
        .stdout(predicate::str::contains("WHEELHOUSE: planned"))
        .stdout(predicate::str::contains("pandas==2.2.1"));

    temp.child("scopes/global/.provision").assert(predicate::path::missing());
    temp.child("state").child(LEDGER_FILE).assert(predicate::path::missing());
}

#[test]
fn test_offline_run_from_find_links() {
    let temp = fixture();

    provision()
        .args(run_args(&temp))
        .assert()
        .success()
        .stdout(predicate::str::contains("✓ DONE"));

    temp.child("scopes/global/site/pytest-7.4.0.artifact")
        .assert(predicate::path::is_file());
    temp.child("scopes/wheelhouse/pandas-2.2.1.artifact")
        .assert(predicate::path::is_file());
    temp.child("scopes/local/site/myapp-cli-1.2.0.artifact")
        .assert(predicate::path::is_file());

    let records = read_records(&temp.path().join("state").join(LEDGER_FILE)).unwrap();
    let installed: Vec<_> = records
        .iter()
        .filter(|r| r.status == InstallStatus::Installed)
        .map(|r| r.name.as_str())
        .collect();
    assert_eq!(installed, vec!["pytest", "pandas", "numpy", "myapp-cli"]);

    let report = RunReport::load(&temp.path().join("state")).unwrap().unwrap();
    assert_eq!(report.final_state, "DONE");
    assert!(report.offline);
}

#[test]
fn test_json_report() {
    let temp = fixture();

    let output = provision_command()
        .args(run_args(&temp))
        .args(["--tier", "global", "--json"])
        .output()
        .unwrap();

    assert!(output.status.success());
    let report: RunReport = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report.final_state, "DONE");
    assert_eq!(report.tiers.len(), 1);
    assert_eq!(report.records.len(), 1);
    assert_eq!(report.records[0].name, "pytest");
}

#[test]
fn test_held_lock_exits_with_code_6() {
    let temp = fixture();
    let _held = RunLock::acquire(&temp.path().join("state")).unwrap();

    provision()
        .args(run_args(&temp))
        .assert()
        .code(6)
        .stderr(predicate::str::contains("holds the lock"));

    temp.child("state").child(LEDGER_FILE).assert(predicate::path::missing());
}

#[test]
fn test_held_scope_lock_exits_with_code_6() {
    let temp = fixture();
    let _held = RunLock::acquire(&temp.path().join("scopes/wheelhouse/.provision")).unwrap();

    provision()
        .args(run_args(&temp))
        .assert()
        .code(6)
        .stderr(predicate::str::contains("wheelhouse"));

    temp.child("scopes/global/site").assert(predicate::path::missing());
}

#[test]
fn test_lock_left_by_killed_run_does_not_block() {
    let temp = fixture();
    temp.child("state").create_dir_all().unwrap();
    temp.child("state")
        .child(LOCK_FILE)
        .write_str("pid=4194303\nstarted=2026-01-01T00:00:00+00:00\n")
        .unwrap();

    provision()
        .args(run_args(&temp))
        .assert()
        .success()
        .stdout(predicate::str::contains("✓ DONE"));
}

#[test]
fn test_offline_miss_exits_with_resolution_code() {
    let temp = fixture();
    temp.child("tiers.txt")
        .write_str("[global]\nrequests==2.31.0\n")
        .unwrap();

    provision()
        .args(run_args(&temp))
        .args(["--quiet"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("requests"));
}
