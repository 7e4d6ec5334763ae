//! Core data models used throughout Memory Harness.
//!
//! These types represent the chunks, vector records, and episodic turns
//! that flow through ingestion, consolidation, and retrieval.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a chunk was cut from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    /// A file under the project root.
    Code,
    /// A consolidated conversation summary.
    Conversation,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Conversation => "conversation",
        }
    }
}

impl fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "code" => Ok(Self::Code),
            "conversation" => Ok(Self::Conversation),
            _ => Err(format!("unknown chunk kind: {s}")),
        }
    }
}

/// A bounded span of text cut from one source, before embedding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentChunk {
    /// Project-relative file path, or `conversation/<start>` for summaries.
    pub source_path: String,
    /// Ordinal within the source, contiguous from 0.
    pub chunk_index: i64,
    pub kind: ChunkKind,
    pub text: String,
    /// SHA-256 hex of `text`.
    pub content_hash: String,
}

impl DocumentChunk {
    /// Store id for this chunk: `<source_path>#<chunk_index>`.
    pub fn id(&self) -> String {
        crate::chunk::record_id(&self.source_path, self.chunk_index)
    }
}

/// A persisted, embedded chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    pub source_path: String,
    pub chunk_index: i64,
    pub kind: ChunkKind,
    pub content_hash: String,
    pub text: String,
    pub embedding: Vec<f32>,
    /// Name of the embedding model that produced `embedding`.
    pub model: String,
    /// Unix milliseconds: file mtime for code, last turn time for conversations.
    pub timestamp: i64,
    /// Free-form metadata (file name, roles, referenced paths, ...).
    pub metadata: serde_json::Value,
}

impl VectorRecord {
    /// Attach an embedding to a chunk.
    pub fn from_chunk(
        chunk: DocumentChunk,
        embedding: Vec<f32>,
        timestamp: i64,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: chunk.id(),
            source_path: chunk.source_path,
            chunk_index: chunk.chunk_index,
            kind: chunk.kind,
            content_hash: chunk.content_hash,
            text: chunk.text,
            embedding,
            model: String::new(),
            timestamp,
            metadata,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

/// A record returned from a similarity query.
#[derive(Debug, Clone)]
pub struct ScoredRecord {
    pub id: String,
    pub source_path: String,
    pub chunk_index: i64,
    pub kind: ChunkKind,
    pub text: String,
    pub timestamp: i64,
    /// Cosine similarity in `[-1.0, 1.0]`.
    pub score: f32,
}

/// Who produced an episodic turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    /// Older logs wrote `assistant`; both spellings load.
    #[serde(alias = "assistant")]
    Agent,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of the episodic log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodicTurn {
    pub timestamp: DateTime<Utc>,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub referenced_paths: BTreeSet<String>,
    /// Wake session that produced the turn. Empty for turns written
    /// before sessions were tracked.
    #[serde(default)]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
}

impl EpisodicTurn {
    pub fn new(session_id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            role,
            content: content.into(),
            referenced_paths: BTreeSet::new(),
            session_id: session_id.into(),
            image_path: None,
        }
    }

    pub fn with_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.referenced_paths.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn with_image(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.referenced_paths.insert(path.clone());
        self.image_path = Some(path);
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Counts produced by one sleep-phase run. Printed, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsolidationManifest {
    pub turns_stored: u64,
    pub conversations: u64,
    pub files_indexed: u64,
    pub files_skipped: u64,
    pub chunks_added: u64,
    pub chunks_updated: u64,
    pub chunks_unchanged: u64,
    pub chunks_removed: u64,
    pub embedding_calls: u64,
    /// Human-readable notes about skipped work (unreadable files, provider outages).
    pub diagnostics: Vec<String>,
}

impl ConsolidationManifest {
    /// Fold another run's counts into this one.
    pub fn merge(&mut self, other: ConsolidationManifest) {
        self.turns_stored += other.turns_stored;
        self.conversations += other.conversations;
        self.files_indexed += other.files_indexed;
        self.files_skipped += other.files_skipped;
        self.chunks_added += other.chunks_added;
        self.chunks_updated += other.chunks_updated;
        self.chunks_unchanged += other.chunks_unchanged;
        self.chunks_removed += other.chunks_removed;
        self.embedding_calls += other.embedding_calls;
        self.diagnostics.extend(other.diagnostics);
    }
}
