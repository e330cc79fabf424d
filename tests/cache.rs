//! Integration coverage for the content-addressed cache (spec §4.D):
//! multi-root lookup order and the advisory write lock, through the public
//! `axisflow::cache` API.

use axisflow::cache::{load, save_result, try_acquire_lock};
use axisflow::{ElementResult, Record, Scalar, Value};

fn result(n: i64) -> ElementResult {
    let mut output = Record::new();
    output.set("out", Value::Scalar(Scalar::Int(n)));
    ElementResult {
        output,
        runtime: Default::default(),
        error: None,
    }
}

#[test]
fn a_later_root_is_never_consulted_once_an_earlier_one_has_the_checksum_dir() {
    let primary = tempfile::tempdir().unwrap();
    let fallback = tempfile::tempdir().unwrap();

    // Only fallback has a finished result; primary has nothing at all yet.
    save_result(&fallback.path().join("AddTwo_abc"), &result(99)).unwrap();
    let found = load(
        "AddTwo_abc",
        &[primary.path().to_path_buf(), fallback.path().to_path_buf()],
    )
    .unwrap();
    assert_eq!(found.unwrap().output.get("out"), Some(&Value::Scalar(Scalar::Int(99))));

    // Now primary has a directory but never finished (claimed, not done):
    // the fallback's finished result must NOT be used.
    std::fs::create_dir_all(primary.path().join("AddTwo_abc")).unwrap();
    let found = load(
        "AddTwo_abc",
        &[primary.path().to_path_buf(), fallback.path().to_path_buf()],
    )
    .unwrap();
    assert!(found.is_none());
}

#[test]
fn missing_checksum_everywhere_is_a_plain_miss() {
    let root = tempfile::tempdir().unwrap();
    let found = load("Nope_xyz", &[root.path().to_path_buf()]).unwrap();
    assert!(found.is_none());
}

#[test]
fn write_lock_prevents_a_second_concurrent_claim() {
    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("AddTwo_abc");
    let lock1 = try_acquire_lock(&dir).unwrap();
    assert!(lock1.is_some());
    assert!(try_acquire_lock(&dir).unwrap().is_none(), "second claim must be refused");
    drop(lock1);
    assert!(try_acquire_lock(&dir).unwrap().is_some(), "lock is released once dropped");
}
