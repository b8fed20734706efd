use std::fs;
use std::path::Path;

use callpatch::{default_output_path, sha256_bytes, sha256_file};
use tempfile::tempdir;

#[test]
fn sha256_bytes_matches_known_vector() {
    assert_eq!(
        sha256_bytes(b"abc"),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
}

#[test]
fn sha256_file_agrees_with_in_memory_hash() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("blob.bin");
    let body: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    fs::write(&path, &body).expect("write blob");

    assert_eq!(sha256_file(&path).expect("hash"), sha256_bytes(&body));
}

#[test]
fn sha256_file_reports_missing_path() {
    let err = sha256_file(Path::new("/definitely/not/here")).unwrap_err();
    assert!(err.to_string().contains("Failed to open binary for hashing"));
}

#[test]
fn default_output_appends_patched_suffix() {
    assert_eq!(default_output_path(Path::new("/tmp/hello")), Path::new("/tmp/hello.patched"));
    assert_eq!(default_output_path(Path::new("a.out")), Path::new("a.out.patched"));
}
