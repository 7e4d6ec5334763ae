//! Indexing pipeline: project files and episodic turns into the vector store.
//!
//! Three entry points, all serialized by one reconcile gate so they never
//! interleave:
//!
//! - [`Indexer::index_all`]: walk the whole project, re-index every
//!   candidate file, and purge sources that no longer exist.
//! - [`Indexer::index_path`]: re-index one changed path (file or
//!   directory, present or deleted). Used by the watch bridge.
//! - [`Indexer::consolidate`]: turn episodic turns newer than the
//!   checkpoint into conversation records, then advance the checkpoint.
//!
//! # Change detection
//!
//! Every chunk's content hash, together with the current provider's model
//! name and dimensions, is compared with the stored record of the same id
//! before embedding. Unchanged chunks are never re-embedded, so
//! re-indexing an untouched tree makes zero provider calls, while
//! switching models re-embeds everything once. After the upserts, chunks
//! beyond the source's new chunk count are purged.
//!
//! Code and conversation records are purged by kind, so a project
//! directory named `conversation/` never touches consolidated memory.
//!
//! # Degraded mode
//!
//! Unreadable files (binary, invalid UTF-8, too large) lose their old
//! chunks and are recorded in the manifest's diagnostics. When the
//! embedding provider is unavailable, the affected files are skipped with
//! a warning; in a full re-index the remaining files are skipped without
//! retrying the provider. Consolidation is all-or-nothing: any failure
//! leaves the checkpoint where it was.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use memory_harness_core::chunk::{chunk_text, record_id};
use memory_harness_core::consolidate::group_turns;
use memory_harness_core::embedding::EmbeddingProvider;
use memory_harness_core::error::is_degraded;
use memory_harness_core::models::{ChunkKind, ConsolidationManifest, DocumentChunk, VectorRecord};
use memory_harness_core::store::{UpsertOutcome, VectorStore};
use memory_harness_core::MemoryError;

use crate::config::Config;
use crate::embedding::embed_in_batches;
use crate::episodic::{Checkpoint, EpisodicLog};
use crate::scan::{Loaded, ProjectScanner};
use crate::watch::ReindexSink;

/// Chunking, batching and grouping knobs.
#[derive(Debug, Clone, Copy)]
pub struct IndexerSettings {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
    pub batch_size: usize,
    pub session_gap: chrono::Duration,
}

impl IndexerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_tokens: config.chunking.max_tokens,
            overlap_tokens: config.chunking.overlap_tokens,
            batch_size: config.embedding.batch_size,
            session_gap: chrono::Duration::minutes(config.consolidation.session_gap_minutes),
        }
    }
}

pub struct Indexer {
    store: Arc<dyn VectorStore>,
    provider: Arc<dyn EmbeddingProvider>,
    scanner: ProjectScanner,
    log: Arc<EpisodicLog>,
    settings: IndexerSettings,
    gate: Mutex<()>,
}

/// Per-run state threaded through file indexing.
#[derive(Default)]
struct Run {
    manifest: ConsolidationManifest,
    /// Set once the provider has failed in this run.
    provider_down: bool,
}

impl Indexer {
    pub fn new(
        store: Arc<dyn VectorStore>,
        provider: Arc<dyn EmbeddingProvider>,
        scanner: ProjectScanner,
        log: Arc<EpisodicLog>,
        settings: IndexerSettings,
    ) -> Self {
        Self {
            store,
            provider,
            scanner,
            log,
            settings,
            gate: Mutex::new(()),
        }
    }

    pub fn scanner(&self) -> &ProjectScanner {
        &self.scanner
    }

    /// Full reconcile of the project tree.
    ///
    /// Afterwards the set of code sources in the store equals the set of
    /// indexable files on disk (minus files skipped for a provider outage,
    /// which keep their previous chunks).
    pub async fn index_all(&self) -> Result<ConsolidationManifest> {
        let _gate = self.gate.lock().await;
        let mut run = Run::default();

        let files = self.scanner.scan()?;
        let on_disk: BTreeSet<&str> = files.iter().map(|f| f.rel_path.as_str()).collect();

        let stale: Vec<String> = self
            .store
            .source_paths(Some(ChunkKind::Code))
            .await?
            .into_iter()
            .filter(|p| !on_disk.contains(p.as_str()))
            .collect();
        for path in &stale {
            let removed = self.store.purge_beyond(ChunkKind::Code, path, 0).await?;
            debug!(source = %path, removed, "purged vanished source");
            run.manifest.chunks_removed += removed as u64;
        }

        for file in &files {
            self.index_file(&file.rel_path, &mut run).await?;
        }

        info!(
            files = run.manifest.files_indexed,
            skipped = run.manifest.files_skipped,
            added = run.manifest.chunks_added,
            updated = run.manifest.chunks_updated,
            unchanged = run.manifest.chunks_unchanged,
            removed = run.manifest.chunks_removed,
            embedding_calls = run.manifest.embedding_calls,
            "full index complete"
        );
        Ok(run.manifest)
    }

    /// Incremental re-index of one path (absolute, or relative to the
    /// project root). Paths outside the root or in excluded directories are
    /// ignored. A deleted path removes every record at or under it.
    pub async fn index_path(&self, path: &Path) -> Result<ConsolidationManifest> {
        let _gate = self.gate.lock().await;
        let mut run = Run::default();

        let Some(rel) = self.scanner.relative(path) else {
            debug!(path = %path.display(), "ignoring path outside project root");
            return Ok(run.manifest);
        };
        if rel.is_empty() || self.scanner.is_excluded(&rel) {
            return Ok(run.manifest);
        }

        match std::fs::metadata(self.scanner.absolute(&rel)) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let removed = self.store.delete_by_prefix(ChunkKind::Code, &rel).await?;
                if removed > 0 {
                    info!(source = %rel, removed, "removed records for deleted path");
                }
                run.manifest.chunks_removed += removed as u64;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to stat {}", rel));
            }
            Ok(meta) if meta.is_dir() => {
                for file in self.scanner.scan()? {
                    if memory_harness_core::store::path_under(&file.rel_path, &rel) {
                        self.index_file(&file.rel_path, &mut run).await?;
                    }
                }
            }
            Ok(_) => {
                if self.scanner.is_candidate(&rel) {
                    self.index_file(&rel, &mut run).await?;
                }
            }
        }
        Ok(run.manifest)
    }

    /// Consolidate episodic turns newer than the checkpoint.
    ///
    /// Either every conversation is stored and the checkpoint advances past
    /// the newest turn, or an error is returned and the checkpoint is left
    /// untouched so the next run retries the same turns.
    ///
    /// If stored conversations were embedded by a different model, the
    /// whole log is consolidated again instead, and conversation records
    /// the rebuild did not produce are removed afterwards.
    pub async fn consolidate(&self) -> Result<ConsolidationManifest> {
        let _gate = self.gate.lock().await;
        let mut manifest = ConsolidationManifest::default();

        let checkpoint = self.log.load_checkpoint()?;
        let rebuild = checkpoint.is_some() && self.conversations_stale().await?;
        let since = match checkpoint {
            Some(_) if rebuild => {
                info!(
                    model = self.provider.model_name(),
                    "embedding model changed; rebuilding conversation memory from the log"
                );
                None
            }
            Some(c) => Some(c.last_consolidated),
            None => None,
        };
        let turns = self.log.read_since(since)?;
        let Some(newest) = turns.last().map(|t| t.timestamp) else {
            debug!("no new turns to consolidate");
            return Ok(manifest);
        };

        let groups = group_turns(&turns, self.settings.session_gap);
        for group in &groups {
            let source = group.source_path();
            let chunks = chunk_text(
                &source,
                ChunkKind::Conversation,
                &group.render(),
                self.settings.max_tokens,
                self.settings.overlap_tokens,
            );
            let timestamp = group
                .ended_at()
                .map(|t| t.timestamp_millis())
                .unwrap_or_default();
            self.store_chunks(
                ChunkKind::Conversation,
                &source,
                chunks,
                timestamp,
                group.metadata(),
                &mut manifest,
            )
            .await
            .with_context(|| format!("Failed to consolidate {}", source))?;
        }

        if rebuild {
            let produced: BTreeSet<String> = groups.iter().map(|g| g.source_path()).collect();
            for source in self.store.source_paths(Some(ChunkKind::Conversation)).await? {
                if !produced.contains(&source) {
                    manifest.chunks_removed += self
                        .store
                        .purge_beyond(ChunkKind::Conversation, &source, 0)
                        .await? as u64;
                }
            }
        }

        self.log.save_checkpoint(&Checkpoint {
            last_consolidated: newest,
        })?;

        manifest.turns_stored = turns.len() as u64;
        manifest.conversations = groups.len() as u64;
        info!(
            turns = manifest.turns_stored,
            conversations = manifest.conversations,
            chunks_added = manifest.chunks_added,
            "consolidation complete"
        );
        Ok(manifest)
    }

    /// True if any conversation record was embedded by another model.
    async fn conversations_stale(&self) -> Result<bool> {
        let model = self.provider.model_name();
        let dims = self.provider.dims();
        for source in self.store.source_paths(Some(ChunkKind::Conversation)).await? {
            if let Some(fp) = self.store.fingerprint(&record_id(&source, 0)).await? {
                if fp.model != model || fp.dims != dims {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Index one candidate file, recording skips in the run's manifest.
    async fn index_file(&self, rel: &str, run: &mut Run) -> Result<()> {
        let (text, modified_ms) = match self.scanner.load(rel) {
            Ok(Loaded::Text { text, modified_ms }) => (text, modified_ms),
            Ok(Loaded::Missing) => {
                run.manifest.chunks_removed +=
                    self.store.purge_beyond(ChunkKind::Code, rel, 0).await? as u64;
                return Ok(());
            }
            Ok(Loaded::Skipped { reason }) => {
                warn!(source = %rel, %reason, "skipping file");
                return self.skip_file(rel, reason, run).await;
            }
            Err(e) => {
                let reason = match MemoryError::find(&e) {
                    Some(me @ MemoryError::ChunkUnreadable { .. }) => me.to_string(),
                    _ => format!("{}: {:#}", rel, e),
                };
                warn!(source = %rel, %reason, "skipping unreadable file");
                return self.skip_file(rel, reason, run).await;
            }
        };

        if run.provider_down {
            run.manifest.files_skipped += 1;
            return Ok(());
        }

        let chunks = chunk_text(
            rel,
            ChunkKind::Code,
            &text,
            self.settings.max_tokens,
            self.settings.overlap_tokens,
        );
        let metadata = file_metadata(rel);

        let mut manifest = ConsolidationManifest::default();
        match self
            .store_chunks(ChunkKind::Code, rel, chunks, modified_ms, metadata, &mut manifest)
            .await
        {
            Ok(()) => {
                manifest.files_indexed = 1;
                run.manifest.merge(manifest);
                Ok(())
            }
            Err(e) if is_degraded(&e) => {
                warn!(source = %rel, error = %format!("{:#}", e), "embedding unavailable; file left as is");
                run.manifest.embedding_calls += manifest.embedding_calls;
                run.manifest.files_skipped += 1;
                run.manifest
                    .diagnostics
                    .push(format!("{}: embedding failed: {:#}", rel, e));
                run.provider_down = true;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn skip_file(&self, rel: &str, reason: String, run: &mut Run) -> Result<()> {
        run.manifest.chunks_removed +=
            self.store.purge_beyond(ChunkKind::Code, rel, 0).await? as u64;
        run.manifest.files_skipped += 1;
        run.manifest.diagnostics.push(reason);
        Ok(())
    }

    /// Embed the changed chunks of one source, upsert them, and purge any
    /// trailing chunks from an older, longer version.
    ///
    /// Nothing is written if embedding fails.
    async fn store_chunks(
        &self,
        kind: ChunkKind,
        source_path: &str,
        chunks: Vec<DocumentChunk>,
        timestamp: i64,
        metadata: serde_json::Value,
        manifest: &mut ConsolidationManifest,
    ) -> Result<()> {
        let chunk_count = chunks.len();
        let model = self.provider.model_name();
        let dims = self.provider.dims();

        let mut pending = Vec::new();
        for chunk in chunks {
            match self.store.fingerprint(&chunk.id()).await? {
                Some(fp) if fp.matches(&chunk.content_hash, model, dims) => {
                    manifest.chunks_unchanged += 1
                }
                _ => pending.push(chunk),
            }
        }

        if !pending.is_empty() {
            let texts: Vec<String> = pending.iter().map(|c| c.text.clone()).collect();
            let (vectors, calls) =
                embed_in_batches(self.provider.as_ref(), &texts, self.settings.batch_size).await?;
            manifest.embedding_calls += calls;

            for (chunk, vector) in pending.into_iter().zip(vectors) {
                let record = VectorRecord::from_chunk(chunk, vector, timestamp, metadata.clone())
                    .with_model(model);
                match self.store.upsert(&record).await? {
                    UpsertOutcome::Inserted => manifest.chunks_added += 1,
                    UpsertOutcome::Updated => manifest.chunks_updated += 1,
                    UpsertOutcome::Unchanged => manifest.chunks_unchanged += 1,
                }
            }
        }

        manifest.chunks_removed += self
            .store
            .purge_beyond(kind, source_path, chunk_count)
            .await? as u64;
        Ok(())
    }
}

fn file_metadata(rel: &str) -> serde_json::Value {
    let path = Path::new(rel);
    json!({
        "file_name": path.file_name().map(|n| n.to_string_lossy().into_owned()),
        "extension": path.extension().map(|e| e.to_string_lossy().into_owned()),
    })
}

#[async_trait]
impl ReindexSink for Indexer {
    async fn reindex(&self, path: PathBuf) {
        match self.index_path(&path).await {
            Ok(m) => debug!(
                path = %path.display(),
                added = m.chunks_added,
                updated = m.chunks_updated,
                removed = m.chunks_removed,
                "incremental index"
            ),
            Err(e) => warn!(path = %path.display(), error = %format!("{:#}", e), "incremental index failed"),
        }
    }
}
