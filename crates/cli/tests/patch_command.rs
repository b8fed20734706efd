use std::fs;

use callpatch::sha256_bytes;
use predicates::prelude::*;
use tempfile::tempdir;

#[path = "../../core/tests/support/mod.rs"]
mod support;

use support::{printf_fixture, write_fixture};

#[test]
fn patch_writes_default_output_and_leaves_input_alone() {
    let dir = tempdir().expect("tempdir");
    let fixture = printf_fixture();
    let binary = write_fixture(dir.path(), "hello", &fixture.bytes);

    assert_cmd::cargo::cargo_bin_cmd!("callpatch")
        .arg("patch")
        .arg("--binary")
        .arg(&binary)
        .assert()
        .success()
        .stdout(predicate::str::contains("Patched 1 of 4 call(s)"))
        .stdout(predicate::str::contains("call 0x401110"));

    let output = dir.path().join("hello.patched");
    let patched = fs::read(&output).expect("patched output");
    assert_eq!(patched.len(), fixture.bytes.len());
    assert_ne!(patched, fixture.bytes);
    assert_eq!(fs::read(&binary).unwrap(), fixture.bytes);
}

#[test]
fn patch_json_summary_reports_hashes_and_sites() {
    let dir = tempdir().expect("tempdir");
    let fixture = printf_fixture();
    let binary = write_fixture(dir.path(), "hello", &fixture.bytes);
    let output = dir.path().join("out.bin");

    let assert = assert_cmd::cargo::cargo_bin_cmd!("callpatch")
        .arg("patch")
        .arg("--binary")
        .arg(&binary)
        .arg("--output")
        .arg(&output)
        .arg("--json")
        .assert()
        .success();

    let stdout = String::from_utf8(assert.get_output().stdout.clone()).expect("utf8");
    let summary: serde_json::Value = serde_json::from_str(&stdout).expect("json summary");

    assert_eq!(summary["input_sha256"], sha256_bytes(&fixture.bytes));
    assert_eq!(summary["output_sha256"], sha256_bytes(&fs::read(&output).unwrap()));
    assert!(summary["started_at"].as_str().is_some_and(|s| s.contains('T')));
    assert_eq!(summary["report"]["replacement"], support::PUTS_ADDR);

    let sites = summary["report"]["sites"].as_array().expect("sites");
    let outcomes: Vec<&str> = sites.iter().filter_map(|s| s["outcome"].as_str()).collect();
    assert_eq!(outcomes[0], "patched");
    assert_eq!(outcomes.len(), 4);
    assert!(outcomes[1..].iter().all(|o| *o == "skipped_pattern_mismatch"));
    assert_eq!(sites[0]["address"], fixture.eligible);
}

#[test]
fn missing_symbol_fails_without_writing_output() {
    let dir = tempdir().expect("tempdir");
    let binary = write_fixture(dir.path(), "hello", &printf_fixture().bytes);

    assert_cmd::cargo::cargo_bin_cmd!("callpatch")
        .arg("patch")
        .arg("--binary")
        .arg(&binary)
        .args(["--source-symbol", "fprintf"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Symbol not found: fprintf"));

    assert!(!dir.path().join("hello.patched").exists());
}

#[test]
fn config_file_and_flags_select_the_replacement() {
    let dir = tempdir().expect("tempdir");
    let binary = write_fixture(dir.path(), "hello", &printf_fixture().bytes);
    let config = dir.path().join("patch.yml");
    fs::write(&config, "target_name_substring: fputs_unlocked\n").unwrap();

    assert_cmd::cargo::cargo_bin_cmd!("callpatch")
        .arg("patch")
        .arg("--binary")
        .arg(&binary)
        .arg("--config")
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("No function matching 'fputs_unlocked'"));

    // The flag overrides the file.
    assert_cmd::cargo::cargo_bin_cmd!("callpatch")
        .arg("patch")
        .arg("--binary")
        .arg(&binary)
        .arg("--config")
        .arg(&config)
        .args(["--target-name", "puts"])
        .assert()
        .success();
}

#[test]
fn missing_binary_is_an_error() {
    let dir = tempdir().expect("tempdir");

    assert_cmd::cargo::cargo_bin_cmd!("callpatch")
        .arg("patch")
        .arg("--binary")
        .arg(dir.path().join("nope"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Binary file does not exist"));
}

#[test]
fn verbose_logging_goes_to_stderr() {
    let dir = tempdir().expect("tempdir");
    let binary = write_fixture(dir.path(), "hello", &printf_fixture().bytes);

    assert_cmd::cargo::cargo_bin_cmd!("callpatch")
        .arg("-v")
        .arg("patch")
        .arg("--binary")
        .arg(&binary)
        .arg("--json")
        .assert()
        .success()
        .stderr(predicate::str::contains("call redirected"))
        .stdout(predicate::str::starts_with("{"));
}
