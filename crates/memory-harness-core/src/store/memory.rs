//! In-memory [`VectorStore`] for tests and ephemeral runs.
//!
//! Records live in a `HashMap` behind `std::sync::RwLock`. Queries are
//! brute-force cosine similarity over every record and block behind any
//! in-flight write.

use std::collections::{BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::models::{ChunkKind, ScoredRecord, VectorRecord};
use crate::retrieve::compare_scored;

use super::{path_under, Fingerprint, RecordFilter, StoreStats, UpsertOutcome, VectorStore};

/// In-memory store keyed by record id.
#[derive(Default)]
pub struct InMemoryStore {
    records: RwLock<HashMap<String, VectorRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, VectorRecord>>> {
        self.records
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, VectorRecord>>> {
        self.records
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

#[async_trait]
impl VectorStore for InMemoryStore {
    async fn upsert(&self, record: &VectorRecord) -> Result<UpsertOutcome> {
        let mut records = self.write()?;
        let outcome = match records.get(&record.id) {
            Some(existing) if Fingerprint::of(existing) == Fingerprint::of(record) => {
                return Ok(UpsertOutcome::Unchanged)
            }
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Inserted,
        };
        records.insert(record.id.clone(), record.clone());
        Ok(outcome)
    }

    async fn get(&self, id: &str) -> Result<Option<VectorRecord>> {
        Ok(self.read()?.get(id).cloned())
    }

    async fn fingerprint(&self, id: &str) -> Result<Option<Fingerprint>> {
        Ok(self.read()?.get(id).map(Fingerprint::of))
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &RecordFilter,
    ) -> Result<Vec<ScoredRecord>> {
        let records = self.read()?;
        let mut scored: Vec<ScoredRecord> = records
            .values()
            .filter(|r| filter.matches(r))
            .map(|r| ScoredRecord {
                id: r.id.clone(),
                source_path: r.source_path.clone(),
                chunk_index: r.chunk_index,
                kind: r.kind,
                text: r.text.clone(),
                timestamp: r.timestamp,
                score: cosine_similarity(vector, &r.embedding),
            })
            .collect();
        scored.sort_by(compare_scored);
        scored.truncate(k);
        Ok(scored)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.write()?.remove(id).is_some())
    }

    async fn delete_by_prefix(&self, kind: ChunkKind, source_path: &str) -> Result<usize> {
        let mut records = self.write()?;
        let before = records.len();
        records.retain(|_, r| r.kind != kind || !path_under(&r.source_path, source_path));
        Ok(before - records.len())
    }

    async fn purge_beyond(
        &self,
        kind: ChunkKind,
        source_path: &str,
        chunk_count: usize,
    ) -> Result<usize> {
        let mut records = self.write()?;
        let before = records.len();
        records.retain(|_, r| {
            r.kind != kind || r.source_path != source_path || r.chunk_index < chunk_count as i64
        });
        Ok(before - records.len())
    }

    async fn source_paths(&self, kind: Option<ChunkKind>) -> Result<BTreeSet<String>> {
        Ok(self
            .read()?
            .values()
            .filter(|r| kind.map_or(true, |k| r.kind == k))
            .map(|r| r.source_path.clone())
            .collect())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let records = self.read()?;
        let mut stats = StoreStats {
            total_records: records.len() as u64,
            ..Default::default()
        };
        let mut sources = BTreeSet::new();
        for r in records.values() {
            match r.kind {
                ChunkKind::Code => stats.code_records += 1,
                ChunkKind::Conversation => stats.conversation_records += 1,
            }
            sources.insert(r.source_path.as_str());
            stats.dims.get_or_insert(r.embedding.len());
        }
        stats.distinct_sources = sources.len() as u64;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::hash_text;
    use serde_json::json;

    fn record(path: &str, idx: i64, kind: ChunkKind, text: &str, v: Vec<f32>, ts: i64) -> VectorRecord {
        VectorRecord {
            id: format!("{}#{}", path, idx),
            source_path: path.to_string(),
            chunk_index: idx,
            kind,
            content_hash: hash_text(text),
            text: text.to_string(),
            embedding: v,
            model: "test".into(),
            timestamp: ts,
            metadata: json!({}),
        }
    }

    #[tokio::test]
    async fn upsert_reports_outcome() {
        let store = InMemoryStore::new();
        let r = record("a.py", 0, ChunkKind::Code, "one", vec![1.0, 0.0], 1);
        assert_eq!(store.upsert(&r).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert(&r).await.unwrap(), UpsertOutcome::Unchanged);
        let changed = record("a.py", 0, ChunkKind::Code, "two", vec![0.0, 1.0], 2);
        assert_eq!(store.upsert(&changed).await.unwrap(), UpsertOutcome::Updated);
        assert_eq!(
            store.content_hash("a.py#0").await.unwrap(),
            Some(hash_text("two"))
        );
    }

    #[tokio::test]
    async fn query_orders_and_filters() {
        let store = InMemoryStore::new();
        store
            .upsert(&record("b.py", 0, ChunkKind::Code, "b", vec![1.0, 0.0], 5))
            .await
            .unwrap();
        store
            .upsert(&record("a.py", 0, ChunkKind::Code, "a", vec![1.0, 0.0], 5))
            .await
            .unwrap();
        store
            .upsert(&record("c.py", 0, ChunkKind::Code, "c", vec![1.0, 0.0], 9))
            .await
            .unwrap();
        store
            .upsert(&record("conversation/x", 0, ChunkKind::Conversation, "x", vec![0.0, 1.0], 1))
            .await
            .unwrap();

        let hits = store
            .query(&[1.0, 0.0], 10, &RecordFilter::default())
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["c.py#0", "a.py#0", "b.py#0", "conversation/x#0"]);

        let convo = store
            .query(&[1.0, 0.0], 10, &RecordFilter::kind(ChunkKind::Conversation))
            .await
            .unwrap();
        assert_eq!(convo.len(), 1);
        assert_eq!(convo[0].kind, ChunkKind::Conversation);

        let top = store
            .query(&[1.0, 0.0], 2, &RecordFilter::default())
            .await
            .unwrap();
        assert_eq!(top.len(), 2);
    }

    #[tokio::test]
    async fn delete_by_prefix_covers_directories() {
        let store = InMemoryStore::new();
        for path in ["src/a.py", "src/b.py", "src2/c.py", "d.py"] {
            store
                .upsert(&record(path, 0, ChunkKind::Code, path, vec![1.0], 0))
                .await
                .unwrap();
        }
        assert_eq!(store.delete_by_prefix(ChunkKind::Code, "src").await.unwrap(), 2);
        let left = store.source_paths(None).await.unwrap();
        assert_eq!(
            left.into_iter().collect::<Vec<_>>(),
            vec!["d.py".to_string(), "src2/c.py".to_string()]
        );
        assert!(store.delete("d.py#0").await.unwrap());
        assert!(!store.delete("d.py#0").await.unwrap());
    }

    #[tokio::test]
    async fn purge_beyond_drops_trailing_chunks() {
        let store = InMemoryStore::new();
        for i in 0..4 {
            store
                .upsert(&record("f.md", i, ChunkKind::Code, &format!("t{}", i), vec![1.0], 0))
                .await
                .unwrap();
        }
        store
            .upsert(&record("g.md", 3, ChunkKind::Code, "g", vec![1.0], 0))
            .await
            .unwrap();
        assert_eq!(store.purge_beyond(ChunkKind::Code, "f.md", 2).await.unwrap(), 2);
        assert!(store.get("f.md#1").await.unwrap().is_some());
        assert!(store.get("f.md#2").await.unwrap().is_none());
        assert!(store.get("g.md#3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn deletes_leave_other_kinds_alone() {
        let store = InMemoryStore::new();
        store
            .upsert(&record("conversation/handler.py", 0, ChunkKind::Code, "code", vec![1.0], 0))
            .await
            .unwrap();
        store
            .upsert(&record(
                "conversation/2024-05-01T10:00:00.000Z",
                0,
                ChunkKind::Conversation,
                "user: hi",
                vec![1.0],
                0,
            ))
            .await
            .unwrap();

        assert_eq!(store.delete_by_prefix(ChunkKind::Code, "conversation").await.unwrap(), 1);
        assert_eq!(
            store
                .purge_beyond(ChunkKind::Code, "conversation/2024-05-01T10:00:00.000Z", 0)
                .await
                .unwrap(),
            0
        );
        assert_eq!(store.stats().await.unwrap().conversation_records, 1);
    }

    #[tokio::test]
    async fn new_model_or_dims_is_an_update() {
        let store = InMemoryStore::new();
        let r = record("a.py", 0, ChunkKind::Code, "same", vec![1.0, 0.0], 1);
        store.upsert(&r).await.unwrap();

        let wider = record("a.py", 0, ChunkKind::Code, "same", vec![1.0, 0.0, 0.0], 1);
        assert_eq!(store.upsert(&wider).await.unwrap(), UpsertOutcome::Updated);
        let renamed = wider.clone().with_model("other");
        assert_eq!(store.upsert(&renamed).await.unwrap(), UpsertOutcome::Updated);

        let fp = store.fingerprint("a.py#0").await.unwrap().unwrap();
        assert!(fp.matches(&hash_text("same"), "other", 3));
        assert!(!fp.matches(&hash_text("same"), "test", 3));
    }

    #[tokio::test]
    async fn stats_count_kinds() {
        let store = InMemoryStore::new();
        store
            .upsert(&record("a.py", 0, ChunkKind::Code, "a", vec![1.0, 0.0], 0))
            .await
            .unwrap();
        store
            .upsert(&record("a.py", 1, ChunkKind::Code, "b", vec![1.0, 0.0], 0))
            .await
            .unwrap();
        store
            .upsert(&record("conversation/t", 0, ChunkKind::Conversation, "c", vec![1.0, 0.0], 0))
            .await
            .unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_records, 3);
        assert_eq!(stats.code_records, 2);
        assert_eq!(stats.conversation_records, 1);
        assert_eq!(stats.distinct_sources, 2);
        assert_eq!(stats.dims, Some(2));
    }
}
