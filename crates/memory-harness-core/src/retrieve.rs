//! Ranking and context-budget selection.
//!
//! The retriever embeds the query and asks the store for candidates; this
//! module decides which of them make it into the prompt.
//!
//! # Selection
//!
//! 1. Sort by score (desc), timestamp (desc), id (asc).
//! 2. Drop candidates below `min_similarity`.
//! 3. Keep at most `top_k`.
//! 4. Walk the survivors in rank order, summing estimated tokens
//!    (`ceil(chars / 4)`). The first candidate that would exceed
//!    `max_context_tokens` is dropped along with everything ranked below
//!    it. A top-ranked candidate that alone exceeds the budget is
//!    truncated to fit and flagged instead.
//!
//! An empty bundle means "no relevant memory" and is not an error.

use std::cmp::Ordering;
use std::fmt::Write as _;

use serde::Serialize;

use crate::chunk::CHARS_PER_TOKEN;
use crate::models::{ChunkKind, ScoredRecord};

/// Total order over scored records: score desc, timestamp desc, id asc.
pub fn compare_scored(a: &ScoredRecord, b: &ScoredRecord) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.timestamp.cmp(&a.timestamp))
        .then_with(|| a.id.cmp(&b.id))
}

/// Estimated token count of `text`.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Retrieval tuning, decoupled from application config.
#[derive(Debug, Clone, Copy)]
pub struct RetrievalParams {
    pub top_k: usize,
    pub min_similarity: f32,
    pub max_context_tokens: usize,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_similarity: 0.2,
            max_context_tokens: 1500,
        }
    }
}

/// One selected piece of memory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextItem {
    pub id: String,
    pub source_path: String,
    pub chunk_index: i64,
    pub kind: ChunkKind,
    pub score: f32,
    pub text: String,
    /// Text was cut to fit the token budget.
    pub truncated: bool,
}

/// Request-scoped context handed to the inference backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContextBundle {
    pub items: Vec<ContextItem>,
    pub total_tokens: usize,
    /// Candidates above the threshold that did not fit the budget.
    pub dropped: usize,
}

impl ContextBundle {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Render as a prompt block. Empty bundles render as an empty string.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.items.is_empty() {
            return out;
        }
        out.push_str("Relevant memory:\n");
        for item in &self.items {
            let _ = writeln!(
                out,
                "--- [{}] {} (score {:.2}){}",
                item.kind,
                item.source_path,
                item.score,
                if item.truncated { " [truncated]" } else { "" }
            );
            out.push_str(item.text.trim_end());
            out.push('\n');
        }
        out
    }
}

/// Pick the context for one query from raw store candidates.
pub fn select_context(mut candidates: Vec<ScoredRecord>, params: &RetrievalParams) -> ContextBundle {
    candidates.sort_by(compare_scored);

    let mut bundle = ContextBundle::default();
    let ranked = candidates
        .into_iter()
        .filter(|c| c.score >= params.min_similarity)
        .take(params.top_k);

    let mut exhausted = false;
    for (rank, cand) in ranked.enumerate() {
        if exhausted {
            bundle.dropped += 1;
            continue;
        }
        let tokens = estimate_tokens(&cand.text);
        if bundle.total_tokens + tokens <= params.max_context_tokens {
            bundle.total_tokens += tokens;
            bundle.items.push(item(cand, false));
        } else if rank == 0 {
            let mut cand = cand;
            cand.text = truncate_chars(&cand.text, params.max_context_tokens * CHARS_PER_TOKEN);
            bundle.total_tokens = estimate_tokens(&cand.text);
            bundle.items.push(item(cand, true));
            exhausted = true;
        } else {
            bundle.dropped += 1;
            exhausted = true;
        }
    }
    bundle
}

fn item(c: ScoredRecord, truncated: bool) -> ContextItem {
    ContextItem {
        id: c.id,
        source_path: c.source_path,
        chunk_index: c.chunk_index,
        kind: c.kind,
        score: c.score,
        text: c.text,
        truncated,
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(id: &str, score: f32, ts: i64, text: &str) -> ScoredRecord {
        ScoredRecord {
            id: id.to_string(),
            source_path: id.split('#').next().unwrap_or(id).to_string(),
            chunk_index: 0,
            kind: ChunkKind::Code,
            text: text.to_string(),
            timestamp: ts,
            score,
        }
    }

    fn params(top_k: usize, min: f32, budget: usize) -> RetrievalParams {
        RetrievalParams {
            top_k,
            min_similarity: min,
            max_context_tokens: budget,
        }
    }

    #[test]
    fn ties_break_on_recency_then_id() {
        let mut v = vec![
            cand("b#0", 0.5, 1, "x"),
            cand("a#0", 0.5, 1, "x"),
            cand("c#0", 0.5, 2, "x"),
            cand("d#0", 0.9, 0, "x"),
        ];
        v.sort_by(compare_scored);
        let ids: Vec<_> = v.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["d#0", "c#0", "a#0", "b#0"]);
    }

    #[test]
    fn threshold_and_top_k_bound_results() {
        let v: Vec<_> = (0..10)
            .map(|i| cand(&format!("f{}#0", i), i as f32 / 10.0, 0, "short"))
            .collect();
        let bundle = select_context(v, &params(5, 0.35, 10_000));
        assert_eq!(bundle.len(), 5);
        assert!(bundle.items.iter().all(|i| i.score >= 0.35));
        assert_eq!(bundle.items[0].id, "f9#0");
    }

    #[test]
    fn nothing_above_threshold_is_empty() {
        let bundle = select_context(vec![cand("a#0", 0.1, 0, "x")], &params(5, 0.5, 100));
        assert!(bundle.is_empty());
        assert_eq!(bundle.render(), "");
    }

    #[test]
    fn budget_drops_lower_ranked_first() {
        let v = vec![
            cand("a#0", 0.9, 0, &"a".repeat(40)),
            cand("b#0", 0.8, 0, &"b".repeat(40)),
            cand("c#0", 0.7, 0, "c"),
        ];
        let bundle = select_context(v, &params(5, 0.0, 15));
        assert_eq!(bundle.len(), 1);
        assert_eq!(bundle.items[0].id, "a#0");
        assert_eq!(bundle.total_tokens, 10);
        assert_eq!(bundle.dropped, 2);
    }

    #[test]
    fn oversized_top_candidate_is_truncated() {
        let v = vec![cand("a#0", 0.9, 0, &"z".repeat(100)), cand("b#0", 0.5, 0, "b")];
        let bundle = select_context(v, &params(5, 0.0, 10));
        assert_eq!(bundle.len(), 1);
        assert!(bundle.items[0].truncated);
        assert_eq!(bundle.items[0].text.len(), 40);
        assert_eq!(bundle.total_tokens, 10);
        assert_eq!(bundle.dropped, 1);
    }

    #[test]
    fn render_lists_sources() {
        let bundle = select_context(vec![cand("auth.py#0", 0.8, 0, "def login():")], &params(5, 0.0, 100));
        let text = bundle.render();
        assert!(text.starts_with("Relevant memory:\n"));
        assert!(text.contains("[code] auth.py (score 0.80)"));
        assert!(text.contains("def login():"));
    }

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
