use std::collections::HashMap;
use std::path::PathBuf;

use lmbridge_config::{ConfigPaths, ConfigStore, EndpointEntry};

fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "lmbridge-config-{tag}-{}",
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn write_endpoint_map(dir: &PathBuf, json: &str) {
    std::fs::write(dir.join("model_endpoint_map.json"), json).unwrap();
}

#[test]
fn round_robin_cycles_in_order() {
    let dir = scratch_dir("rr");
    write_endpoint_map(
        &dir,
        r#"{"m2": [
            {"session_id": "B1"},
            {"session_id": "B2"},
            {"session_id": "B3"}
        ]}"#,
    );
    let store = ConfigStore::load(ConfigPaths::in_dir(&dir));

    let mut picked = Vec::new();
    for _ in 0..6 {
        let entry = store.get_endpoint("m2").unwrap();
        let EndpointEntry::Pool(bindings) = entry else {
            panic!("expected a pool");
        };
        let index = store.peek_round_robin("m2", bindings.len());
        picked.push(bindings[index].session_id.clone());
        store.advance_round_robin("m2");
    }
    assert_eq!(picked, ["B1", "B2", "B3", "B1", "B2", "B3"]);

    // After six enqueues the cursor is back at the first binding.
    assert_eq!(store.peek_round_robin("m2", 3), 0);
}

#[test]
fn cursor_position_after_two_requests() {
    let dir = scratch_dir("rr-cursor");
    write_endpoint_map(
        &dir,
        r#"{"m2": [
            {"session_id": "B1"},
            {"session_id": "B2"},
            {"session_id": "B3"}
        ]}"#,
    );
    let store = ConfigStore::load(ConfigPaths::in_dir(&dir));

    store.advance_round_robin("m2");
    store.advance_round_robin("m2");
    // Two requests enqueued: the third binding is next.
    assert_eq!(store.peek_round_robin("m2", 3), 2);
}

#[test]
fn failed_reload_keeps_previous_snapshot() {
    let dir = scratch_dir("reload");
    std::fs::write(dir.join("config.jsonc"), r#"{"api_key": "first"}"#).unwrap();
    let store = ConfigStore::load(ConfigPaths::in_dir(&dir));
    assert_eq!(store.config().api_key.as_deref(), Some("first"));

    // Broken JSON must not replace the snapshot.
    std::fs::write(dir.join("config.jsonc"), "{ not json").unwrap();
    store.force_reload();
    assert_eq!(store.config().api_key.as_deref(), Some("first"));

    // A valid file swaps in again.
    std::fs::write(dir.join("config.jsonc"), r#"{"api_key": "second"}"#).unwrap();
    store.force_reload();
    assert_eq!(store.config().api_key.as_deref(), Some("second"));
}

#[test]
fn model_names_prefer_endpoint_map() {
    let dir = scratch_dir("names");
    write_endpoint_map(&dir, r#"{"alpha": {"session_id": "s"}}"#);
    std::fs::write(dir.join("models.json"), r#"{"beta": "id:text"}"#).unwrap();
    let store = ConfigStore::load(ConfigPaths::in_dir(&dir));
    assert_eq!(store.model_names(), vec!["alpha".to_string()]);

    write_endpoint_map(&dir, "{}");
    store.force_reload();
    assert_eq!(store.model_names(), vec!["beta".to_string()]);
}

#[test]
fn upsert_endpoint_persists_to_disk() {
    let dir = scratch_dir("upsert");
    write_endpoint_map(&dir, "{}");
    let store = ConfigStore::load(ConfigPaths::in_dir(&dir));

    let entry: EndpointEntry =
        serde_json::from_value(serde_json::json!({"session_id": "captured"})).unwrap();
    store.upsert_endpoint("captured-model", entry).unwrap();

    let on_disk: HashMap<String, EndpointEntry> = serde_json::from_str(
        &std::fs::read_to_string(dir.join("model_endpoint_map.json")).unwrap(),
    )
    .unwrap();
    assert!(on_disk.contains_key("captured-model"));
    assert!(store.get_endpoint("captured-model").is_some());
}
