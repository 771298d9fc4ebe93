//! Integration tests for the `kube-loadgen` binary: arg parsing and help
//! output, exercised without needing a cluster.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_flag() {
    Command::cargo_bin("kube-loadgen")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Workload generator"))
        .stdout(predicate::str::contains("init"))
        .stdout(predicate::str::contains("destroy"));
}

#[test]
fn version_flag() {
    Command::cargo_bin("kube-loadgen")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("kube-loadgen"));
}

#[test]
fn version_subcommand_prints_build_version() {
    Command::cargo_bin("kube-loadgen")
        .unwrap()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn init_rejects_missing_config_file() {
    Command::cargo_bin("kube-loadgen")
        .unwrap()
        .args(["init", "--config", "/nonexistent/config.yaml"])
        .assert()
        .failure();
}
