//! End-to-end tests for the texbridge CLI.

#![allow(deprecated)] // Allow deprecated Command::cargo_bin for tests

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// =============================================================================
// Test Helpers
// =============================================================================

/// Engine module fixture shipped with texbridge-core's tests.
fn mini_engine() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("texbridge-core")
        .join("tests")
        .join("fixtures")
        .join("mini_engine.wat")
}

/// Create a project directory holding `files`.
fn project(files: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().expect("Failed to create temp directory");
    for (name, contents) in files {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create project subdirectory");
        }
        fs::write(&path, contents).expect("Failed to write project file");
    }
    dir
}

fn texbridge() -> Command {
    let mut cmd = Command::cargo_bin("texbridge").unwrap();
    cmd.env_remove("TEXBRIDGE_ENDPOINT")
        .env_remove("TEXBRIDGE_MODULE")
        .env_remove("TEXBRIDGE_FETCH_TIMEOUT_SECS");
    cmd
}

fn compile(project: &Path) -> Command {
    let mut cmd = texbridge();
    cmd.arg("compile")
        .arg(project)
        .args(["--engine", "pdftex", "--endpoint", "http://127.0.0.1:9/pdftex/"])
        .arg("--module")
        .arg(mini_engine());
    cmd
}

// =============================================================================
// Tests
// =============================================================================

#[test]
fn test_help_lists_commands() {
    texbridge()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("compile"))
        .stdout(predicate::str::contains("engines"));
}

#[test]
fn test_engines_lists_variants() {
    texbridge()
        .arg("engines")
        .assert()
        .success()
        .stdout(predicate::str::contains("xetex"))
        .stdout(predicate::str::contains("dvipdfmx"))
        .stdout(predicate::str::contains("swiftlatexpdftex.wasm"));
}

#[test]
fn test_unknown_engine_is_a_bridge_error() {
    let dir = project(&[("main.tex", "x")]);
    texbridge()
        .args(["compile", "--engine", "luatex"])
        .arg(dir.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown engine"));
}

#[test]
fn test_missing_module_is_a_bridge_error() {
    let dir = project(&[("main.tex", "x")]);
    texbridge()
        .arg("compile")
        .arg(dir.path())
        .args(["--module", "/nonexistent/engine.wasm"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("failed to load engine module"));
}

#[test]
fn test_compile_writes_artifact() {
    let dir = project(&[("main.tex", "\\documentclass{article}"), ("figs/a.txt", "fig")]);

    compile(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote"));

    let artifact = fs::read(dir.path().join("main.pdf")).unwrap();
    assert_eq!(artifact, b"PDF-BYTES");
}

#[test]
fn test_compile_with_custom_output_and_json() {
    let dir = project(&[("main.tex", "x")]);
    let output = dir.path().join("out").join("doc.pdf");
    fs::create_dir_all(output.parent().unwrap()).unwrap();

    compile(dir.path())
        .arg("--json")
        .arg("--output")
        .arg(&output)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\": 0"))
        .stdout(predicate::str::contains("hello from wasm"));

    assert_eq!(fs::read(&output).unwrap(), b"PDF-BYTES");
}

#[test]
fn test_missing_output_exits_with_one() {
    let dir = project(&[("main.tex", "x")]);

    compile(dir.path())
        .arg("--pdf")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("No output produced"));
}

#[test]
fn test_module_abort_is_a_bridge_error() {
    let dir = project(&[("crash.tex", "x")]);

    compile(dir.path())
        .args(["--main", "crash.tex"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("engine module aborted"));
}
