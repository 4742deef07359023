//! Integration tests for the persistent map over the file engine

use futures::future::try_join_all;
use graphpersist::storage::{JOURNAL_FILE, SNAPSHOT_FILE, StoreSnapshot};
use graphpersist::{DurabilityMode, GraphError, MapState, PersistentMap, StoreConfig};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

fn disk_map(dir: &TempDir, durability: DurabilityMode) -> PersistentMap {
    PersistentMap::from_config(&StoreConfig::on_disk(dir.path()).durability(durability))
}

#[tokio::test]
async fn test_values_survive_reopen_through_journal() {
    let temp_dir = TempDir::new().unwrap();
    {
        let map = disk_map(&temp_dir, DurabilityMode::Async);
        map.put("b", json!({"n": 2})).await.unwrap();
        map.put("a", json!([1, 2, 3])).await.unwrap();
        map.put("c", json!("gone")).await.unwrap();
        assert!(map.delete("c").await.unwrap());
        // dropped without close: only the journal holds the data
    }
    assert!(temp_dir.path().join(JOURNAL_FILE).exists());

    let map = disk_map(&temp_dir, DurabilityMode::Async);
    assert_eq!(map.all_keys().await.unwrap(), vec!["a", "b"]);
    assert_eq!(map.get("b").await.unwrap(), Some(json!({"n": 2})));
    assert!(!map.has("c").await.unwrap());
}

#[tokio::test]
async fn test_sync_durability_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    {
        let map = disk_map(&temp_dir, DurabilityMode::Sync);
        map.put("k", json!(true)).await.unwrap();
    }
    let map = disk_map(&temp_dir, DurabilityMode::Sync);
    assert_eq!(map.get("k").await.unwrap(), Some(json!(true)));
}

#[tokio::test]
async fn test_close_writes_snapshot_and_empties_journal() {
    let temp_dir = TempDir::new().unwrap();
    let map = disk_map(&temp_dir, DurabilityMode::Async);
    map.put("x", json!(1)).await.unwrap();
    map.put("y", json!(2)).await.unwrap();
    map.close().await.unwrap();
    map.close().await.unwrap();
    assert_eq!(map.state(), MapState::Closed);

    let snapshot_bytes = std::fs::read(temp_dir.path().join(SNAPSHOT_FILE)).unwrap();
    let snapshot: StoreSnapshot = serde_json::from_slice(&snapshot_bytes).unwrap();
    assert_eq!(snapshot.metadata.entry_count, 2);
    assert_eq!(snapshot.entries.get("y"), Some(&json!(2)));
    let journal = std::fs::metadata(temp_dir.path().join(JOURNAL_FILE)).unwrap();
    assert_eq!(journal.len(), 0);

    let reopened = disk_map(&temp_dir, DurabilityMode::Async);
    assert_eq!(reopened.len().await.unwrap(), 2);
}

#[tokio::test]
async fn test_journal_compacts_after_threshold() {
    let temp_dir = TempDir::new().unwrap();
    let config = StoreConfig::on_disk(temp_dir.path()).compact_after_ops(3);
    let map = PersistentMap::from_config(&config);

    map.put("a", json!(1)).await.unwrap();
    map.put("b", json!(2)).await.unwrap();
    assert!(!temp_dir.path().join(SNAPSHOT_FILE).exists());
    map.put("c", json!(3)).await.unwrap();
    assert!(temp_dir.path().join(SNAPSHOT_FILE).exists());
    assert_eq!(
        std::fs::metadata(temp_dir.path().join(JOURNAL_FILE))
            .unwrap()
            .len(),
        0
    );

    map.put("d", json!(4)).await.unwrap();
    drop(map);

    let reopened = PersistentMap::from_config(&config);
    assert_eq!(reopened.all_keys().await.unwrap(), vec!["a", "b", "c", "d"]);
}

#[tokio::test]
async fn test_no_journal_mode_persists_only_on_close() {
    let temp_dir = TempDir::new().unwrap();
    {
        let map = disk_map(&temp_dir, DurabilityMode::None);
        map.put("lost", json!(1)).await.unwrap();
    }
    assert!(!temp_dir.path().join(JOURNAL_FILE).exists());
    let map = disk_map(&temp_dir, DurabilityMode::None);
    assert!(map.is_empty().await.unwrap());

    map.put("kept", json!(2)).await.unwrap();
    map.close().await.unwrap();
    let reopened = disk_map(&temp_dir, DurabilityMode::None);
    assert_eq!(reopened.get("kept").await.unwrap(), Some(json!(2)));
}

#[tokio::test]
async fn test_clear_is_replayed() {
    let temp_dir = TempDir::new().unwrap();
    {
        let map = disk_map(&temp_dir, DurabilityMode::Async);
        map.put("a", json!(1)).await.unwrap();
        map.clear().await.unwrap();
        map.put("b", json!(2)).await.unwrap();
    }
    let map = disk_map(&temp_dir, DurabilityMode::Async);
    assert_eq!(map.all_keys().await.unwrap(), vec!["b"]);
}

#[tokio::test]
async fn test_concurrent_writes_to_distinct_keys() {
    let temp_dir = TempDir::new().unwrap();
    let map = Arc::new(disk_map(&temp_dir, DurabilityMode::Async));

    try_join_all((0..20).map(|i| {
        let map = map.clone();
        async move { map.put(&format!("key{:02}", i), json!(i)).await }
    }))
    .await
    .unwrap();

    assert_eq!(map.len().await.unwrap(), 20);
    assert_eq!(map.get("key07").await.unwrap(), Some(json!(7)));
}

#[tokio::test]
async fn test_unusable_directory_fails_open_for_good() {
    let temp_dir = TempDir::new().unwrap();
    let blocker = temp_dir.path().join("not_a_dir");
    std::fs::write(&blocker, b"file").unwrap();

    let map = PersistentMap::from_config(&StoreConfig::on_disk(&blocker));
    assert!(matches!(map.open().await, Err(GraphError::StoreInit(_))));
    assert!(matches!(map.get("a").await, Err(GraphError::StoreInit(_))));
    assert!(matches!(map.state(), MapState::Failed(_)));
}
