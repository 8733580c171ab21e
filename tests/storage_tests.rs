use std::collections::BTreeMap;

use smallrender::storage;

#[test]
fn json_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("record.json");

    let mut value = BTreeMap::new();
    value.insert("key".to_string(), 42i64);

    storage::write_json(&path, &value).unwrap();
    let read: BTreeMap<String, i64> = storage::read_json(&path).unwrap();
    assert_eq!(read, value);
}

#[test]
fn read_absent_file_is_none() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.json");
    assert!(storage::read_json::<serde_json::Value>(&path).is_none());
    assert!(storage::read_text(&path).is_none());
}

#[test]
fn read_partial_file_is_none() {
    // A half-synced file must look absent, never raise.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("partial.json");
    std::fs::write(&path, "{\"key\": 42, \"trunc").unwrap();
    assert!(storage::read_json::<serde_json::Value>(&path).is_none());
}

#[test]
fn write_leaves_no_tmp_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("record.json");
    storage::write_json(&path, &serde_json::json!({"a": 1})).unwrap();

    let names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(names, vec!["record.json"]);
}

#[test]
fn write_replaces_existing_content_atomically() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("record.json");

    storage::write_json(&path, &serde_json::json!({"v": 1})).unwrap();
    storage::write_json(&path, &serde_json::json!({"v": 2})).unwrap();

    let read: serde_json::Value = storage::read_json(&path).unwrap();
    assert_eq!(read["v"], 2);
}

#[test]
fn text_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("node_id.txt");
    storage::write_text(&path, "aabbccddeeff").unwrap();
    assert_eq!(storage::read_text(&path).unwrap(), "aabbccddeeff");
}

#[test]
fn write_into_missing_directory_fails_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nope").join("record.json");
    assert!(storage::write_json(&path, &serde_json::json!({})).is_err());
    assert!(!path.exists());
}
