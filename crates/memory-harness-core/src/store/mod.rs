//! Storage abstraction for Memory Harness.
//!
//! The [`VectorStore`] trait defines every operation the indexer and
//! retriever need, so the SQLite store and the [`memory::InMemoryStore`]
//! are interchangeable. Implementations must be `Send + Sync` and
//! serialize their own writes.

pub mod memory;

use std::collections::BTreeSet;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::models::{ChunkKind, ScoredRecord, VectorRecord};

/// Restricts a [`VectorStore::query`] to a subset of records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub kind: Option<ChunkKind>,
}

impl RecordFilter {
    pub fn kind(kind: ChunkKind) -> Self {
        Self { kind: Some(kind) }
    }

    pub fn matches(&self, record: &VectorRecord) -> bool {
        self.kind.map_or(true, |k| k == record.kind)
    }
}

/// What an [`VectorStore::upsert`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// Same id, different [`Fingerprint`].
    Updated,
    /// Same id and fingerprint; nothing was written.
    Unchanged,
}

/// Record counts for reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total_records: u64,
    pub code_records: u64,
    pub conversation_records: u64,
    pub distinct_sources: u64,
    /// Dimensionality of stored vectors, if any are stored.
    pub dims: Option<usize>,
}

/// What change detection compares. A stored chunk is current only if its
/// text and the model that embedded it both match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub content_hash: String,
    pub model: String,
    pub dims: usize,
}

impl Fingerprint {
    pub fn of(record: &VectorRecord) -> Self {
        Self {
            content_hash: record.content_hash.clone(),
            model: record.model.clone(),
            dims: record.embedding.len(),
        }
    }

    pub fn matches(&self, content_hash: &str, model: &str, dims: usize) -> bool {
        self.content_hash == content_hash && self.model == model && self.dims == dims
    }
}

/// True if `path` is `prefix` itself or lies under it as a directory.
pub fn path_under(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    path == prefix
        || (path.len() > prefix.len()
            && path.starts_with(prefix)
            && path.as_bytes()[prefix.len()] == b'/')
}

/// Abstract vector store.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](VectorStore::upsert) | Insert or replace a record by id |
/// | [`get`](VectorStore::get) | Fetch one record |
/// | [`fingerprint`](VectorStore::fingerprint) | Change-detection lookup |
/// | [`query`](VectorStore::query) | Top-k cosine similarity search |
/// | [`delete`](VectorStore::delete) | Remove one record |
/// | [`delete_by_prefix`](VectorStore::delete_by_prefix) | Remove a file's or directory's records |
/// | [`purge_beyond`](VectorStore::purge_beyond) | Drop stale trailing chunks |
/// | [`source_paths`](VectorStore::source_paths) | Distinct sources, for reconcile |
/// | [`stats`](VectorStore::stats) | Counts for reporting |
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace a record by id. A record whose id and
    /// [`Fingerprint`] already match is left untouched.
    async fn upsert(&self, record: &VectorRecord) -> Result<UpsertOutcome>;

    async fn get(&self, id: &str) -> Result<Option<VectorRecord>>;

    /// Fingerprint of the record with this id, if present.
    async fn fingerprint(&self, id: &str) -> Result<Option<Fingerprint>>;

    async fn content_hash(&self, id: &str) -> Result<Option<String>> {
        Ok(self.fingerprint(id).await?.map(|f| f.content_hash))
    }

    /// The `k` records most similar to `vector` that match `filter`,
    /// ordered by [`compare_scored`](crate::retrieve::compare_scored).
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &RecordFilter,
    ) -> Result<Vec<ScoredRecord>>;

    /// Returns whether a record was removed.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Remove every record of `kind` whose source path is `source_path` or
    /// lies under it. Returns the number removed.
    async fn delete_by_prefix(&self, kind: ChunkKind, source_path: &str) -> Result<usize>;

    /// Remove records of `kind` and `source_path` with
    /// `chunk_index >= chunk_count`.
    async fn purge_beyond(
        &self,
        kind: ChunkKind,
        source_path: &str,
        chunk_count: usize,
    ) -> Result<usize>;

    /// Release any underlying resources. Further calls may fail.
    async fn close(&self) {}

    /// Distinct source paths, optionally of one kind.
    async fn source_paths(&self, kind: Option<ChunkKind>) -> Result<BTreeSet<String>>;

    async fn stats(&self) -> Result<StoreStats>;
}
