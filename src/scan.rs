//! Project tree scanner.
//!
//! Walks `project.root` and selects the files the indexer should see:
//! matched by `include_globs`, not matched by `exclude_globs`, and never
//! inside the data directory. Paths are reported relative to the root with
//! `/` separators; those strings are the `source_path` of every code chunk.
//!
//! [`ProjectScanner::load`] reads one file as text, refusing binaries,
//! invalid UTF-8, and anything over `max_file_bytes`.

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

use memory_harness_core::MemoryError;

use crate::config::ProjectConfig;

/// How many leading bytes are checked for NUL when sniffing binaries.
const BINARY_SNIFF_BYTES: usize = 8000;

/// A file selected by the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectFile {
    pub rel_path: String,
    pub abs_path: PathBuf,
}

/// Result of reading one candidate file.
#[derive(Debug)]
pub enum Loaded {
    Text { text: String, modified_ms: i64 },
    /// The file no longer exists.
    Missing,
    /// Present but deliberately not indexed (too large).
    Skipped { reason: String },
}

pub struct ProjectScanner {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
    max_file_bytes: u64,
    follow_symlinks: bool,
}

impl ProjectScanner {
    pub fn new(project: &ProjectConfig, data_dir: &Path) -> Result<Self> {
        let root = project.root.canonicalize().with_context(|| {
            format!("Project root does not exist: {}", project.root.display())
        })?;

        let mut excludes = project.exclude_globs.clone();
        if let Ok(data_abs) = data_dir.canonicalize() {
            if let Ok(rel) = data_abs.strip_prefix(&root) {
                let rel = slash_path(rel);
                if !rel.is_empty() {
                    excludes.push(format!("{}/**", rel));
                }
            }
        }

        Ok(Self {
            root,
            include: build_globset(&project.include_globs)?,
            exclude: build_globset(&excludes)?,
            max_file_bytes: project.max_file_bytes,
            follow_symlinks: project.follow_symlinks,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Root-relative `/`-separated path, or `None` if `path` is outside the
    /// root. Relative inputs are taken as already relative to the root.
    pub fn relative(&self, path: &Path) -> Option<String> {
        if path.is_relative() {
            if path.components().any(|c| matches!(c, Component::ParentDir)) {
                return None;
            }
            return Some(slash_path(path));
        }
        let rel = path.strip_prefix(&self.root).ok()?;
        Some(slash_path(rel))
    }

    pub fn absolute(&self, rel_path: &str) -> PathBuf {
        self.root.join(rel_path)
    }

    /// True if a file at `rel_path` would be indexed by a full scan.
    pub fn is_candidate(&self, rel_path: &str) -> bool {
        !rel_path.is_empty() && !self.exclude.is_match(rel_path) && self.include.is_match(rel_path)
    }

    /// True if `rel_path` is excluded itself or is a directory whose
    /// contents are excluded.
    pub fn is_excluded(&self, rel_path: &str) -> bool {
        self.exclude.is_match(rel_path) || self.exclude.is_match(format!("{}/_", rel_path))
    }

    /// All candidate files under the root, sorted by relative path.
    pub fn scan(&self) -> Result<Vec<ProjectFile>> {
        let mut files = Vec::new();
        let walker = WalkDir::new(&self.root).follow_links(self.follow_symlinks);
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(rel) = self.relative(entry.path()) else {
                continue;
            };
            if !self.is_candidate(&rel) {
                continue;
            }
            files.push(ProjectFile {
                rel_path: rel,
                abs_path: entry.path().to_path_buf(),
            });
        }
        files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        Ok(files)
    }

    /// Read a file as UTF-8 text.
    ///
    /// Binary and undecodable files fail with
    /// [`MemoryError::ChunkUnreadable`].
    pub fn load(&self, rel_path: &str) -> Result<Loaded> {
        let path = self.absolute(rel_path);
        let metadata = match std::fs::metadata(&path) {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Ok(Loaded::Missing),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Loaded::Missing),
            Err(e) => return Err(e).with_context(|| format!("Failed to stat {}", path.display())),
        };

        if metadata.len() > self.max_file_bytes {
            return Ok(Loaded::Skipped {
                reason: format!(
                    "{} is {} bytes, over the {} byte limit",
                    rel_path,
                    metadata.len(),
                    self.max_file_bytes
                ),
            });
        }

        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Loaded::Missing),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
        };
        let text = decode_text(rel_path, bytes)?;

        let modified_ms = metadata
            .modified()
            .unwrap_or(SystemTime::UNIX_EPOCH)
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;

        Ok(Loaded::Text { text, modified_ms })
    }
}

fn decode_text(rel_path: &str, bytes: Vec<u8>) -> Result<String> {
    let sniff = &bytes[..bytes.len().min(BINARY_SNIFF_BYTES)];
    if sniff.contains(&0) {
        return Err(MemoryError::ChunkUnreadable {
            path: rel_path.to_string(),
            reason: "binary content".into(),
        }
        .into());
    }
    String::from_utf8(bytes).map_err(|e| {
        MemoryError::ChunkUnreadable {
            path: rel_path.to_string(),
            reason: format!("not valid UTF-8 ({})", e.utf8_error()),
        }
        .into()
    })
}

fn slash_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}
