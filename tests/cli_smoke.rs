//! Behavioural smoke tests for the CLI entrypoint.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::str::contains;
use tempfile::TempDir;

#[test]
fn cli_without_arguments_prints_usage() {
    let mut cmd = cargo_bin_cmd!("kiln");
    cmd.assert().failure().code(2).stderr(contains("Usage"));
}

#[test]
fn cli_help_lists_build() {
    let mut cmd = cargo_bin_cmd!("kiln");
    cmd.arg("--help");
    cmd.assert().success().stdout(contains("build"));
}

#[test]
fn build_help_lists_provisioning_flags() {
    let mut cmd = cargo_bin_cmd!("kiln");
    cmd.args(["build", "--help"]);
    cmd.assert()
        .success()
        .stdout(contains("--provision"))
        .stdout(contains("--script"))
        .stdout(contains("--vmid"));
}

#[test]
fn build_without_configuration_fails() {
    let home = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let mut cmd = cargo_bin_cmd!("kiln");
    cmd.env_clear()
        .env("HOME", home.path())
        .env("XDG_CONFIG_HOME", home.path())
        .current_dir(home.path())
        .arg("build");

    cmd.assert()
        .failure()
        .code(1)
        .stderr(contains("configuration error"));
}
