use std::time::Duration;

use lpcache_api::error::ErrorKind;
use lpcache_api::store::CacheStore;
use lpcache_storage_sqlite::{SqliteCacheStore, SqliteStoreConfig};

fn open(dir: &tempfile::TempDir) -> SqliteCacheStore {
    SqliteCacheStore::open(&SqliteStoreConfig::with_path(dir.path().join("nested/cache.sqlite"))).unwrap()
}

#[tokio::test]
async fn rowids_are_offsets() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);

    assert_eq!(store.end_offset().await.unwrap(), 1);
    assert_eq!(store.first_offset().await.unwrap(), None);

    let offsets = store.append(["cpu v=1 1", "cpu v=2 2", "cpu v=3 3"]).await.unwrap();
    assert_eq!(offsets, vec![1, 2, 3]);

    let records = store.read_from(2, 10).await.unwrap();
    assert_eq!(records.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![2, 3]);
    assert_eq!(records[0].line, b"cpu v=2 2");
    assert_eq!(store.read_from(1, 1).await.unwrap().len(), 1);
    assert_eq!(store.count_from(2).await.unwrap(), 2);
    assert_eq!(store.end_offset().await.unwrap(), 4);
}

#[tokio::test]
async fn reclaim_keeps_high_water_row() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    store.append(["a v=1", "b v=2", "c v=3"]).await.unwrap();

    // Everything consumed: the newest row stays as the rowid high-water mark.
    assert_eq!(store.reclaim(4).await.unwrap(), 2);
    assert_eq!(store.first_offset().await.unwrap(), Some(3));
    assert!(store.read_from(4, 10).await.unwrap().is_empty());
    assert_eq!(store.count_from(4).await.unwrap(), 0);

    drop(store);
    let reopened = open(&dir);
    assert_eq!(reopened.append(["d v=4"]).await.unwrap(), vec![4]);
    assert_eq!(reopened.reclaim(5).await.unwrap(), 1);
    assert_eq!(reopened.end_offset().await.unwrap(), 5);
}

#[tokio::test]
async fn reads_rows_written_by_another_connection() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let path = store.path().to_path_buf();

    let writer = tokio::task::spawn_blocking(move || {
        std::thread::sleep(Duration::from_millis(50));
        let conn = rusqlite::Connection::open(path).unwrap();
        conn.execute("INSERT INTO LineProtocolCache (line_protocol) VALUES (?1)", ["mem free=1i"])
            .unwrap();
    });

    // No in-process notification: the bounded wait re-checks the table.
    let mut records = Vec::new();
    for _ in 0..100 {
        store.wait_for_data(1, Duration::from_millis(20)).await;
        records = store.read_from(1, 10).await.unwrap();
        if !records.is_empty() {
            break;
        }
    }
    writer.await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].line_lossy(), "mem free=1i");
}

#[tokio::test]
async fn append_wakes_waiting_reader() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);

    let writer = store.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        writer.append(["late v=1"]).await.unwrap();
    });

    let started = std::time::Instant::now();
    store.wait_for_data(1, Duration::from_secs(10)).await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(store.read_from(1, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn non_text_value_is_a_format_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.sqlite");
    {
        // A table without TEXT affinity keeps integers as integers.
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE LineProtocolCache (line_protocol NOT NULL);
             INSERT INTO LineProtocolCache (line_protocol) VALUES (42);",
        )
        .unwrap();
    }

    let store = SqliteCacheStore::open(&SqliteStoreConfig::with_path(&path)).unwrap();
    let err = store.read_from(1, 10).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Format);
    assert!(err.message().contains("invalid row 1"));
}

#[tokio::test]
async fn read_only_open_leaves_the_file_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent/cache.sqlite");
    assert!(SqliteCacheStore::open_read_only(&SqliteStoreConfig::with_path(&missing)).is_err());
    assert!(!dir.path().join("absent").exists());

    let path = dir.path().join("cache.sqlite");
    {
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE LineProtocolCache (line_protocol TEXT NOT NULL);
             INSERT INTO LineProtocolCache (line_protocol) VALUES ('cpu v=1 1');",
        )
        .unwrap();
    }

    let store = SqliteCacheStore::open_read_only(&SqliteStoreConfig::with_path(&path)).unwrap();
    assert_eq!(store.end_offset().await.unwrap(), 2);
    assert_eq!(store.count_from(1).await.unwrap(), 1);
    drop(store);

    let conn = rusqlite::Connection::open(&path).unwrap();
    let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0)).unwrap();
    assert_eq!(mode, "delete");
}
