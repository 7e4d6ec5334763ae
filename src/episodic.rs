//! Episodic log: the append-only record of every interaction turn.
//!
//! One JSON object per line in `session_log.jsonl`. Each append is
//! followed by `fsync` before it returns, so an acknowledged turn survives
//! a crash. Timestamps are millisecond precision and strictly increasing
//! within the log; a turn stamped at or before its predecessor is moved to
//! one millisecond after it.
//!
//! Consolidation progress lives next to the log in
//! `consolidation.checkpoint`, written to a temporary file and renamed into
//! place.
//!
//! Readers skip torn or malformed lines with a warning.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use memory_harness_core::models::EpisodicTurn;
use memory_harness_core::MemoryError;

/// Contents of `consolidation.checkpoint`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Timestamp of the newest turn already consolidated.
    pub last_consolidated: DateTime<Utc>,
}

struct Writer {
    file: Option<File>,
    last_ts: Option<DateTime<Utc>>,
}

pub struct EpisodicLog {
    path: PathBuf,
    checkpoint_path: PathBuf,
    writer: Mutex<Writer>,
}

impl EpisodicLog {
    /// Open the log, creating its directory. The file itself is created on
    /// first append.
    pub fn open(path: &Path, checkpoint_path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let last_ts = read_turns_from(path)?.last().map(|t| t.timestamp);
        Ok(Self {
            path: path.to_path_buf(),
            checkpoint_path: checkpoint_path.to_path_buf(),
            writer: Mutex::new(Writer {
                file: None,
                last_ts,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably append one turn and return it as written (with its final
    /// timestamp). Any failure is a [`MemoryError::LogWriteFailure`].
    pub fn append(&self, turn: EpisodicTurn) -> Result<EpisodicTurn, MemoryError> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| MemoryError::LogWriteFailure(std::io::Error::other("log lock poisoned")))?;

        let mut turn = turn;
        let ts = turn
            .timestamp
            .duration_trunc(Duration::milliseconds(1))
            .unwrap_or(turn.timestamp);
        turn.timestamp = match writer.last_ts {
            Some(last) if ts <= last => last + Duration::milliseconds(1),
            _ => ts,
        };

        let mut line = serde_json::to_string(&turn)
            .map_err(|e| MemoryError::LogWriteFailure(std::io::Error::other(e)))?;
        line.push('\n');

        if writer.file.is_none() {
            writer.file = Some(open_for_append(&self.path).map_err(MemoryError::LogWriteFailure)?);
        }
        if let Some(file) = writer.file.as_mut() {
            file.write_all(line.as_bytes())
                .and_then(|_| file.sync_data())
                .map_err(MemoryError::LogWriteFailure)?;
        }

        writer.last_ts = Some(turn.timestamp);
        Ok(turn)
    }

    /// Force everything written so far to disk.
    pub fn flush(&self) -> Result<(), MemoryError> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| MemoryError::LogWriteFailure(std::io::Error::other("log lock poisoned")))?;
        if let Some(file) = writer.file.as_mut() {
            file.flush()
                .and_then(|_| file.sync_all())
                .map_err(MemoryError::LogWriteFailure)?;
        }
        Ok(())
    }

    /// [`append`](Self::append) on the blocking pool, so the fsync does not
    /// stall the runtime.
    pub async fn append_async(self: &Arc<Self>, turn: EpisodicTurn) -> Result<EpisodicTurn, MemoryError> {
        let log = Arc::clone(self);
        tokio::task::spawn_blocking(move || log.append(turn))
            .await
            .map_err(|e| MemoryError::LogWriteFailure(std::io::Error::other(e)))?
    }

    pub async fn flush_async(self: &Arc<Self>) -> Result<(), MemoryError> {
        let log = Arc::clone(self);
        tokio::task::spawn_blocking(move || log.flush())
            .await
            .map_err(|e| MemoryError::LogWriteFailure(std::io::Error::other(e)))?
    }

    /// Every readable turn, in timestamp order.
    pub fn read_all(&self) -> Result<Vec<EpisodicTurn>> {
        read_turns_from(&self.path)
    }

    /// Turns newer than `after` (all turns if `None`).
    pub fn read_since(&self, after: Option<DateTime<Utc>>) -> Result<Vec<EpisodicTurn>> {
        let mut turns = self.read_all()?;
        if let Some(after) = after {
            turns.retain(|t| t.timestamp > after);
        }
        Ok(turns)
    }

    /// Load the consolidation checkpoint. A missing file means nothing has
    /// been consolidated; an unreadable one is treated the same way (the
    /// next consolidation then repeats earlier work, which is harmless).
    pub fn load_checkpoint(&self) -> Result<Option<Checkpoint>> {
        let content = match std::fs::read_to_string(&self.checkpoint_path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read {}", self.checkpoint_path.display())
                })
            }
        };
        match serde_json::from_str(&content) {
            Ok(cp) => Ok(Some(cp)),
            Err(e) => {
                warn!(
                    path = %self.checkpoint_path.display(),
                    error = %e,
                    "ignoring malformed consolidation checkpoint"
                );
                Ok(None)
            }
        }
    }

    /// Atomically replace the checkpoint.
    pub fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let tmp = self.checkpoint_path.with_extension("checkpoint.tmp");
        let json = serde_json::to_string_pretty(checkpoint)?;
        {
            let mut f = File::create(&tmp)
                .with_context(|| format!("Failed to create {}", tmp.display()))?;
            f.write_all(json.as_bytes())?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &self.checkpoint_path).with_context(|| {
            format!("Failed to replace {}", self.checkpoint_path.display())
        })?;
        Ok(())
    }

    /// Forget the checkpoint so the next consolidation covers the whole
    /// log. Returns whether there was one.
    pub fn clear_checkpoint(&self) -> Result<bool> {
        match std::fs::remove_file(&self.checkpoint_path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| {
                format!("Failed to remove {}", self.checkpoint_path.display())
            }),
        }
    }
}

/// Open for appending. If a previous crash left a torn final line, start
/// on a fresh line so the next record stays parseable.
fn open_for_append(path: &Path) -> std::io::Result<File> {
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;
    let len = file.metadata()?.len();
    if len > 0 {
        file.seek(SeekFrom::Start(len - 1))?;
        let mut last = [0u8; 1];
        file.read_exact(&mut last)?;
        if last[0] != b'\n' {
            file.write_all(b"\n")?;
            file.sync_data()?;
        }
    }
    Ok(file)
}

fn read_turns_from(path: &Path) -> Result<Vec<EpisodicTurn>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to open {}", path.display())),
    };

    let mut turns = Vec::new();
    for (n, line) in BufReader::new(file).split(b'\n').enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<EpisodicTurn>(&line) {
            Ok(turn) => turns.push(turn),
            Err(e) => warn!(line = n + 1, error = %e, "skipping malformed episodic log line"),
        }
    }
    turns.sort_by_key(|t| t.timestamp);
    Ok(turns)
}
