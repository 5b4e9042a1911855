//! The `pake` command: build-file discovery, `-f` handling and exit-code
//! passthrough, exercised against stub build-file scripts.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

fn pake() -> Command {
    Command::cargo_bin("pake").unwrap()
}

#[test]
fn missing_build_file_exits_with_code_one() {
    let dir = TempDir::new().unwrap();
    pake()
        .current_dir(dir.path())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("pakefile"));
}

#[test]
fn discovered_build_file_runs_with_forwarded_arguments() {
    let dir = TempDir::new().unwrap();
    write_script(dir.path(), "pakefile", "echo args: \"$@\"");

    pake()
        .current_dir(dir.path())
        .args(["build", "-j", "4"])
        .assert()
        .success()
        .stdout(predicate::str::contains("args: build -j 4"));
}

#[test]
fn build_file_exit_codes_pass_through() {
    let dir = TempDir::new().unwrap();
    write_script(dir.path(), "pakefile", "exit 9");

    pake().current_dir(dir.path()).assert().code(9);
}

#[test]
fn explicit_files_run_in_order_and_stop_on_failure() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("log");
    let a = write_script(dir.path(), "a", &format!("echo a >> {}", log.display()));
    let b = write_script(
        dir.path(),
        "b",
        &format!("echo b >> {}; exit 5", log.display()),
    );
    let c = write_script(dir.path(), "c", &format!("echo c >> {}", log.display()));

    pake()
        .args([
            "-f",
            a.to_str().unwrap(),
            "-f",
            b.to_str().unwrap(),
            "-f",
            c.to_str().unwrap(),
        ])
        .assert()
        .code(5);

    let log = fs::read_to_string(&log).unwrap();
    assert_eq!(log, "a\nb\n");
}

#[test]
fn explicit_missing_file_exits_with_code_one() {
    pake()
        .args(["-f", "no/such/build/file"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn file_flags_are_stripped_from_forwarded_arguments() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "custom", "echo got: \"$@\"");

    pake()
        .args(["-f", script.to_str().unwrap(), "sometask", "-n"])
        .assert()
        .success()
        .stdout(predicate::str::contains("got: sometask -n"));
}

#[test]
fn discovery_respects_a_forwarded_directory_flag() {
    let dir = TempDir::new().unwrap();
    let sub = dir.path().join("project");
    fs::create_dir(&sub).unwrap();
    write_script(&sub, "pakefile", "echo found here");

    pake()
        .current_dir(dir.path())
        .args(["-C", sub.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("found here"));
}
