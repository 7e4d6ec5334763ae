//! Persistence and corruption recovery of the SQLite vector store.

use std::fs;

use serde_json::json;
use tempfile::TempDir;

use memory_harness::sqlite_store::SqliteStore;
use memory_harness_core::chunk::chunk_text;
use memory_harness_core::embedding::HashingProvider;
use memory_harness_core::models::{ChunkKind, VectorRecord};
use memory_harness_core::store::{RecordFilter, UpsertOutcome, VectorStore};
use memory_harness_core::MemoryError;

fn record(provider: &HashingProvider, path: &str, kind: ChunkKind, text: &str) -> VectorRecord {
    let chunk = chunk_text(path, kind, text, 200, 20).remove(0);
    let embedding = provider.embed_one(&chunk.text);
    VectorRecord::from_chunk(chunk, embedding, 1_700_000_000_000, json!({ "test": true }))
}

#[tokio::test]
async fn records_survive_reopen() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("data/vectors.sqlite");
    let provider = HashingProvider::new(64);

    {
        let store = SqliteStore::open(&path).await.unwrap();
        assert!(store.recovered_from().is_none());
        let r = record(&provider, "auth.py", ChunkKind::Code, "def login(): pass");
        assert_eq!(store.upsert(&r).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert(&r).await.unwrap(), UpsertOutcome::Unchanged);
        let c = record(
            &provider,
            "conversation/2024-05-01T09:00:00.000Z",
            ChunkKind::Conversation,
            "user: how does login work?",
        );
        store.upsert(&c).await.unwrap();
        store.close().await;
    }

    let store = SqliteStore::open(&path).await.unwrap();
    assert!(store.recovered_from().is_none());
    let stats = store.stats().await.unwrap();
    assert_eq!(stats.total_records, 2);
    assert_eq!(stats.code_records, 1);
    assert_eq!(stats.conversation_records, 1);
    assert_eq!(stats.dims, Some(64));

    let got = store.get("auth.py#0").await.unwrap().unwrap();
    assert_eq!(got.text, "def login(): pass");
    assert_eq!(got.metadata["test"], true);

    let query = provider.embed_one("login");
    let hits = store
        .query(&query, 5, &RecordFilter::kind(ChunkKind::Code))
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].source_path, "auth.py");
}

#[tokio::test]
async fn updates_deletes_and_purges() {
    let tmp = TempDir::new().unwrap();
    let store = SqliteStore::open(&tmp.path().join("vectors.sqlite"))
        .await
        .unwrap();
    let provider = HashingProvider::new(32);

    let text: String = (0..100).map(|i| format!("line {}\n", i)).collect();
    for chunk in chunk_text("src/long.rs", ChunkKind::Code, &text, 20, 2) {
        let embedding = provider.embed_one(&chunk.text);
        let r = VectorRecord::from_chunk(chunk, embedding, 1, json!({}));
        store.upsert(&r).await.unwrap();
    }
    let r = record(&provider, "src/other.rs", ChunkKind::Code, "fn other() {}");
    store.upsert(&r).await.unwrap();
    let mut changed = record(&provider, "src/other.rs", ChunkKind::Code, "fn other() { 1 }");
    changed.timestamp = 2;
    assert_eq!(store.upsert(&changed).await.unwrap(), UpsertOutcome::Updated);

    let before = store.stats().await.unwrap().total_records;
    let removed = store.purge_beyond(ChunkKind::Code, "src/long.rs", 1).await.unwrap();
    assert_eq!(store.stats().await.unwrap().total_records, before - removed as u64);
    assert!(store.get("src/long.rs#0").await.unwrap().is_some());
    assert!(store.get("src/long.rs#1").await.unwrap().is_none());

    assert_eq!(store.delete_by_prefix(ChunkKind::Code, "src").await.unwrap(), 2);
    assert_eq!(store.stats().await.unwrap().total_records, 0);
    assert!(!store.delete("src/other.rs#0").await.unwrap());
}

#[tokio::test]
async fn garbage_file_is_set_aside_and_replaced() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("vectors.sqlite");
    fs::write(&path, "this is definitely not a sqlite database\n".repeat(200)).unwrap();

    let store = SqliteStore::open(&path).await.unwrap();
    assert!(matches!(
        store.recovered_from(),
        Some(MemoryError::StoreCorrupt { .. })
    ));
    assert_eq!(store.stats().await.unwrap().total_records, 0);

    let quarantined: Vec<String> = fs::read_dir(tmp.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("vectors.sqlite.corrupt-"))
        .filter(|n| !n.ends_with("-wal") && !n.ends_with("-shm"))
        .collect();
    assert_eq!(quarantined.len(), 1);

    // The replacement is a working store.
    let provider = HashingProvider::new(16);
    let r = record(&provider, "a.py", ChunkKind::Code, "print('hi')");
    store.upsert(&r).await.unwrap();
    assert_eq!(store.stats().await.unwrap().total_records, 1);
}

#[tokio::test]
async fn model_is_stored_and_old_stores_gain_the_column() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("vectors.sqlite");
    let provider = HashingProvider::new(8);

    // A store written before records carried their model.
    {
        let pool = memory_harness::db::connect(&path).await.unwrap();
        sqlx::query(
            "CREATE TABLE records (
                id TEXT PRIMARY KEY,
                source_path TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                kind TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                text TEXT NOT NULL,
                embedding BLOB NOT NULL,
                dims INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                metadata_json TEXT NOT NULL DEFAULT '{}',
                UNIQUE(source_path, chunk_index)
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        let r = record(&provider, "auth.py", ChunkKind::Code, "def login(): pass");
        sqlx::query(
            "INSERT INTO records (id, source_path, chunk_index, kind, content_hash, text, embedding, dims, timestamp)
             VALUES (?, ?, ?, 'code', ?, ?, ?, ?, 1)",
        )
        .bind(&r.id)
        .bind(&r.source_path)
        .bind(r.chunk_index as i64)
        .bind(&r.content_hash)
        .bind(&r.text)
        .bind(memory_harness_core::embedding::vec_to_blob(&r.embedding))
        .bind(r.embedding.len() as i64)
        .execute(&pool)
        .await
        .unwrap();
        pool.close().await;
    }

    let store = SqliteStore::open(&path).await.unwrap();
    assert!(store.recovered_from().is_none());
    let r = record(&provider, "auth.py", ChunkKind::Code, "def login(): pass");
    let old = store.fingerprint(&r.id).await.unwrap().unwrap();
    assert!(old.matches(&r.content_hash, "", 8));
    assert!(!old.matches(&r.content_hash, "hash", 8));

    // Same text from a named model replaces the unlabelled vector.
    let labelled = r.clone().with_model("hash");
    assert_eq!(store.upsert(&labelled).await.unwrap(), UpsertOutcome::Updated);
    assert_eq!(store.upsert(&labelled).await.unwrap(), UpsertOutcome::Unchanged);
    assert_eq!(store.get(&r.id).await.unwrap().unwrap().model, "hash");
}
