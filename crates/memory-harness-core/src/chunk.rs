//! Overlapping span chunker.
//!
//! Splits source text into [`DocumentChunk`]s of at most `max_tokens`
//! (converted to characters) with a fixed overlap between consecutive
//! spans, so a function or sentence cut at a boundary still appears whole
//! in at least one chunk more often than not.
//!
//! Each chunk gets a deterministic id (`<source_path>#<index>`) and a
//! SHA-256 hash of its text, which the indexer compares against the store
//! to skip re-embedding unchanged spans.
//!
//! # Algorithm
//!
//! 1. Convert `max_tokens` / `overlap_tokens` to characters using a
//!    4 chars/token ratio. Overlap is clamped to half a span.
//! 2. If the remaining text fits in one span, emit it and stop.
//! 3. Otherwise take a window of `max_chars`, and break it at the last
//!    newline (or failing that, the last space) in the back half of the
//!    window. With neither, hard-split at the window edge.
//! 4. The next span starts `overlap_chars` before the break.
//! 5. Byte offsets always snap to UTF-8 char boundaries.
//!
//! Blank input produces no chunks.
//!
//! # Example
//!
//! ```rust
//! use memory_harness_core::chunk::chunk_text;
//! use memory_harness_core::models::ChunkKind;
//!
//! let chunks = chunk_text("notes.md", ChunkKind::Code, "Hello world.\n\nSecond paragraph.", 200, 20);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].id(), "notes.md#0");
//! ```

use sha2::{Digest, Sha256};

use crate::models::{ChunkKind, DocumentChunk};

/// Approximate characters-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Split text into overlapping spans of at most `max_tokens`.
///
/// # Guarantees
///
/// - Chunk indices are contiguous: `0, 1, 2, …, N-1`.
/// - Every chunk is at most `max_tokens × 4` bytes.
/// - Consecutive chunks share `overlap_tokens × 4` bytes (less only where
///   a multi-byte character forces the boundary back).
/// - Identical input always yields identical chunks and hashes.
pub fn chunk_text(
    source_path: &str,
    kind: ChunkKind,
    text: &str,
    max_tokens: usize,
    overlap_tokens: usize,
) -> Vec<DocumentChunk> {
    let max_chars = (max_tokens * CHARS_PER_TOKEN).max(CHARS_PER_TOKEN);
    let overlap_chars = (overlap_tokens * CHARS_PER_TOKEN).min(max_chars / 2);

    let mut chunks = Vec::new();
    if text.trim().is_empty() {
        return chunks;
    }

    let mut push = |piece: &str| {
        if !piece.trim().is_empty() {
            let index = chunks.len() as i64;
            chunks.push(make_chunk(source_path, kind, index, piece));
        }
    };

    let mut start = 0usize;
    loop {
        if text.len() - start <= max_chars {
            push(&text[start..]);
            break;
        }

        let end = snap_to_char_boundary(text, start + max_chars);
        let window = &text[start..end];
        let min_break = window.len() / 2;
        let brk = window
            .rfind('\n')
            .filter(|&p| p >= min_break)
            .or_else(|| window.rfind(' ').filter(|&p| p >= min_break))
            .map(|p| start + p + 1)
            .unwrap_or(end);
        let brk = if brk <= start {
            next_char_boundary(text, start)
        } else {
            brk
        };

        push(&text[start..brk]);

        let next = snap_to_char_boundary(text, brk.saturating_sub(overlap_chars));
        start = if next <= start { brk } else { next };
    }

    chunks
}

/// Store id for a chunk of `source_path`.
pub fn record_id(source_path: &str, chunk_index: i64) -> String {
    format!("{}#{}", source_path, chunk_index)
}

/// SHA-256 hex digest of `text`.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn next_char_boundary(s: &str, index: usize) -> usize {
    s[index..]
        .char_indices()
        .nth(1)
        .map(|(i, _)| index + i)
        .unwrap_or(s.len())
}

fn make_chunk(source_path: &str, kind: ChunkKind, index: i64, text: &str) -> DocumentChunk {
    DocumentChunk {
        source_path: source_path.to_string(),
        chunk_index: index,
        kind,
        text: text.to_string(),
        content_hash: hash_text(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(n: usize) -> String {
        (0..n)
            .map(|i| format!("line number {:03} of the file", i))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_text("a.py", ChunkKind::Code, "def login():\n    pass\n", 200, 20);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].text, "def login():\n    pass\n");
        assert_eq!(chunks[0].content_hash, hash_text("def login():\n    pass\n"));
    }

    #[test]
    fn test_blank_text_has_no_chunks() {
        assert!(chunk_text("a.py", ChunkKind::Code, "", 200, 20).is_empty());
        assert!(chunk_text("a.py", ChunkKind::Code, " \n\t\n", 200, 20).is_empty());
    }

    #[test]
    fn test_spans_bounded_and_contiguous() {
        let text = lines(200);
        let chunks = chunk_text("big.txt", ChunkKind::Code, &text, 50, 10);
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64, "index mismatch at {}", i);
            assert!(c.text.len() <= 200, "chunk {} too long: {}", i, c.text.len());
        }
    }

    #[test]
    fn test_consecutive_spans_overlap() {
        let text = lines(120);
        let chunks = chunk_text("big.txt", ChunkKind::Code, &text, 50, 10);
        assert!(chunks.len() > 2);
        for pair in chunks.windows(2) {
            let shared = &pair[1].text[..40];
            assert!(
                pair[0].text.ends_with(shared),
                "expected {:?} to end with {:?}",
                pair[0].text,
                shared
            );
        }
    }

    #[test]
    fn test_covers_whole_text() {
        let text = lines(80);
        let chunks = chunk_text("big.txt", ChunkKind::Code, &text, 40, 5);
        assert!(text.starts_with(&chunks[0].text));
        assert!(text.ends_with(&chunks.last().unwrap().text));
        for c in &chunks {
            assert!(text.contains(&c.text));
        }
    }

    #[test]
    fn test_breaks_on_newline() {
        let text = lines(60);
        let chunks = chunk_text("big.txt", ChunkKind::Code, &text, 50, 0);
        for c in &chunks[..chunks.len() - 1] {
            assert!(c.text.ends_with('\n'), "expected line break: {:?}", c.text);
        }
    }

    #[test]
    fn test_unbroken_text_hard_splits() {
        let text = "x".repeat(1000);
        let chunks = chunk_text("blob.txt", ChunkKind::Code, &text, 25, 5);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.text.len() <= 100));
    }

    #[test]
    fn test_multibyte_utf8_chars() {
        let text = "┌──────────────────┐\n│ Hello world      │\n└──────────────────┘".repeat(10);
        let chunks = chunk_text("box.txt", ChunkKind::Code, &text, 3, 1);
        assert!(!chunks.is_empty());
        for c in &chunks {
            assert!(!c.text.is_empty());
        }
    }

    #[test]
    fn test_deterministic() {
        let text = lines(90);
        let c1 = chunk_text("d.txt", ChunkKind::Code, &text, 30, 6);
        let c2 = chunk_text("d.txt", ChunkKind::Code, &text, 30, 6);
        assert_eq!(c1, c2);
    }

    #[test]
    fn test_hash_changes_with_text() {
        let a = chunk_text("f.md", ChunkKind::Code, "alpha", 100, 0);
        let b = chunk_text("f.md", ChunkKind::Code, "alphb", 100, 0);
        assert_ne!(a[0].content_hash, b[0].content_hash);
        assert_eq!(a[0].id(), b[0].id());
    }

    #[test]
    fn test_record_id_format() {
        assert_eq!(record_id("src/auth.py", 3), "src/auth.py#3");
    }
}
