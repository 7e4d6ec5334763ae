//! SQLite-backed [`VectorStore`].
//!
//! One row per chunk in the `records` table; embeddings are little-endian
//! f32 BLOBs. Similarity search is brute-force cosine over the rows that
//! match the filter, which is fine for a single project's worth of chunks.
//!
//! Writes go through an internal async mutex so only one upsert or delete
//! runs at a time. Reads use the pool directly and see a WAL snapshot.
//!
//! # Corruption recovery
//!
//! [`SqliteStore::open`] runs `PRAGMA integrity_check` on an existing file.
//! If the file is not a database or is damaged, it (and its `-wal`/`-shm`
//! siblings) is renamed to `<name>.corrupt-<timestamp>` and an empty store
//! is created in its place. The failure is logged and kept in
//! [`SqliteStore::recovered_from`] for the caller to report.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, error};

use memory_harness_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use memory_harness_core::models::{ChunkKind, ScoredRecord, VectorRecord};
use memory_harness_core::retrieve::compare_scored;
use memory_harness_core::store::{Fingerprint, RecordFilter, StoreStats, UpsertOutcome, VectorStore};
use memory_harness_core::MemoryError;

use crate::{db, migrate};

pub struct SqliteStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
    path: PathBuf,
    recovered_from: Option<MemoryError>,
}

impl SqliteStore {
    /// Open the store at `path`, recovering from corruption.
    pub async fn open(path: &Path) -> Result<Self> {
        let mut recovered_from = None;
        if path.exists() {
            if let Err(e) = db::check_integrity(path).await {
                let reason = format!("{:#}", e);
                let moved = quarantine(path)?;
                error!(
                    path = %path.display(),
                    moved_to = %moved.display(),
                    %reason,
                    "vector store failed integrity check; starting empty"
                );
                recovered_from = Some(MemoryError::StoreCorrupt {
                    path: path.display().to_string(),
                    reason,
                });
            }
        }

        let pool = db::connect(path).await?;
        migrate::run_migrations(&pool)
            .await
            .context("Failed to initialize vector store schema")?;

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
            path: path.to_path_buf(),
            recovered_from,
        })
    }

    /// The corruption that [`open`](Self::open) recovered from, if any.
    pub fn recovered_from(&self) -> Option<&MemoryError> {
        self.recovered_from.as_ref()
    }

    pub fn take_recovered(&mut self) -> Option<MemoryError> {
        self.recovered_from.take()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Move a damaged database and its WAL files out of the way.
fn quarantine(path: &Path) -> Result<PathBuf> {
    let suffix = format!("corrupt-{}", chrono::Utc::now().format("%Y%m%dT%H%M%S"));
    let moved = sibling(path, &suffix);
    std::fs::rename(path, &moved)
        .with_context(|| format!("Failed to move corrupt store {}", path.display()))?;
    for ext in ["-wal", "-shm"] {
        let side = sibling(path, ext);
        if side.exists() {
            let target = sibling(&moved, ext);
            if let Err(e) = std::fs::rename(&side, &target) {
                debug!(path = %side.display(), error = %e, "could not move sidecar file");
            }
        }
    }
    Ok(moved)
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    if suffix.starts_with('-') {
        name.push(suffix);
    } else {
        name.push(".");
        name.push(suffix);
    }
    PathBuf::from(name)
}

fn parse_kind(s: &str) -> Result<ChunkKind> {
    s.parse::<ChunkKind>().map_err(|e| anyhow!(e))
}

fn row_to_record(row: &SqliteRow) -> Result<VectorRecord> {
    let kind: String = row.try_get("kind")?;
    let blob: Vec<u8> = row.try_get("embedding")?;
    let metadata_json: String = row.try_get("metadata_json")?;
    Ok(VectorRecord {
        id: row.try_get("id")?,
        source_path: row.try_get("source_path")?,
        chunk_index: row.try_get("chunk_index")?,
        kind: parse_kind(&kind)?,
        content_hash: row.try_get("content_hash")?,
        text: row.try_get("text")?,
        embedding: blob_to_vec(&blob),
        model: row.try_get("model")?,
        timestamp: row.try_get("timestamp")?,
        metadata: serde_json::from_str(&metadata_json).unwrap_or(serde_json::json!({})),
    })
}

#[async_trait]
impl VectorStore for SqliteStore {
    async fn upsert(&self, record: &VectorRecord) -> Result<UpsertOutcome> {
        let _guard = self.write_lock.lock().await;

        let outcome = match self.fingerprint(&record.id).await? {
            Some(fp) if fp == Fingerprint::of(record) => return Ok(UpsertOutcome::Unchanged),
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Inserted,
        };

        sqlx::query(
            r#"
            INSERT INTO records (id, source_path, chunk_index, kind, content_hash, text,
                                 embedding, dims, model, timestamp, metadata_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                content_hash = excluded.content_hash,
                text = excluded.text,
                embedding = excluded.embedding,
                dims = excluded.dims,
                model = excluded.model,
                timestamp = excluded.timestamp,
                metadata_json = excluded.metadata_json
            "#,
        )
        .bind(&record.id)
        .bind(&record.source_path)
        .bind(record.chunk_index)
        .bind(record.kind.as_str())
        .bind(&record.content_hash)
        .bind(&record.text)
        .bind(vec_to_blob(&record.embedding))
        .bind(record.embedding.len() as i64)
        .bind(&record.model)
        .bind(record.timestamp)
        .bind(record.metadata.to_string())
        .execute(&self.pool)
        .await?;

        Ok(outcome)
    }

    async fn get(&self, id: &str) -> Result<Option<VectorRecord>> {
        let row = sqlx::query("SELECT * FROM records WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn fingerprint(&self, id: &str) -> Result<Option<Fingerprint>> {
        let row = sqlx::query("SELECT content_hash, model, dims FROM records WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| -> Result<Fingerprint> {
            let dims: i64 = row.try_get("dims")?;
            Ok(Fingerprint {
                content_hash: row.try_get("content_hash")?,
                model: row.try_get("model")?,
                dims: dims as usize,
            })
        })
        .transpose()
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &RecordFilter,
    ) -> Result<Vec<ScoredRecord>> {
        let kind = filter.kind.map(|k| k.as_str());
        let rows = sqlx::query(
            r#"
            SELECT id, source_path, chunk_index, kind, text, timestamp, embedding
            FROM records
            WHERE (?1 IS NULL OR kind = ?1)
            "#,
        )
        .bind(kind)
        .fetch_all(&self.pool)
        .await?;

        let mut scored = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.try_get("embedding")?;
            let kind: String = row.try_get("kind")?;
            scored.push(ScoredRecord {
                id: row.try_get("id")?,
                source_path: row.try_get("source_path")?,
                chunk_index: row.try_get("chunk_index")?,
                kind: parse_kind(&kind)?,
                text: row.try_get("text")?,
                timestamp: row.try_get("timestamp")?,
                score: cosine_similarity(vector, &blob_to_vec(&blob)),
            });
        }
        scored.sort_by(compare_scored);
        scored.truncate(k);
        Ok(scored)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let res = sqlx::query("DELETE FROM records WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn delete_by_prefix(&self, kind: ChunkKind, source_path: &str) -> Result<usize> {
        let prefix = source_path.trim_end_matches('/');
        if prefix.is_empty() {
            return Ok(0);
        }
        let dir = format!("{}/", prefix);

        let _guard = self.write_lock.lock().await;
        let res = sqlx::query(
            "DELETE FROM records WHERE kind = ? AND (source_path = ? OR substr(source_path, 1, ?) = ?)",
        )
        .bind(kind.as_str())
        .bind(prefix)
        .bind(dir.len() as i64)
        .bind(&dir)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() as usize)
    }

    async fn purge_beyond(
        &self,
        kind: ChunkKind,
        source_path: &str,
        chunk_count: usize,
    ) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let res = sqlx::query(
            "DELETE FROM records WHERE kind = ? AND source_path = ? AND chunk_index >= ?",
        )
        .bind(kind.as_str())
        .bind(source_path)
        .bind(chunk_count as i64)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() as usize)
    }

    async fn source_paths(&self, kind: Option<ChunkKind>) -> Result<BTreeSet<String>> {
        let paths: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT source_path FROM records WHERE (?1 IS NULL OR kind = ?1)",
        )
        .bind(kind.map(|k| k.as_str()))
        .fetch_all(&self.pool)
        .await?;
        Ok(paths.into_iter().collect())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let rows = sqlx::query("SELECT kind, COUNT(*) AS n FROM records GROUP BY kind")
            .fetch_all(&self.pool)
            .await?;
        let mut stats = StoreStats::default();
        for row in &rows {
            let kind: String = row.try_get("kind")?;
            let n: i64 = row.try_get("n")?;
            match parse_kind(&kind)? {
                ChunkKind::Code => stats.code_records = n as u64,
                ChunkKind::Conversation => stats.conversation_records = n as u64,
            }
            stats.total_records += n as u64;
        }

        let distinct: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT source_path) FROM records")
            .fetch_one(&self.pool)
            .await?;
        stats.distinct_sources = distinct as u64;

        let dims: Option<i64> = sqlx::query_scalar("SELECT dims FROM records LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        stats.dims = dims.map(|d| d as usize);
        Ok(stats)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
