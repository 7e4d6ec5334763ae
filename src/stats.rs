//! Memory statistics.
//!
//! A quick summary of what memory holds: records by kind, distinct
//! sources, the episodic log's size, and how far consolidation has got.
//! Used by `mem stats` to confirm that sleep cycles are doing their job.

use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use memory_harness_core::store::{StoreStats, VectorStore};

use crate::episodic::EpisodicLog;

#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub store: StoreStats,
    pub log_turns: usize,
    /// Turns newer than the checkpoint, waiting for the next sleep.
    pub pending_turns: usize,
    pub last_consolidated: Option<DateTime<Utc>>,
    pub store_bytes: u64,
}

pub async fn collect_stats(
    store: &dyn VectorStore,
    log: &EpisodicLog,
    store_path: Option<&Path>,
) -> Result<MemoryStats> {
    let store_stats = store.stats().await?;
    let turns = log.read_all()?;
    let last_consolidated = log.load_checkpoint()?.map(|c| c.last_consolidated);
    let pending_turns = match last_consolidated {
        Some(cp) => turns.iter().filter(|t| t.timestamp > cp).count(),
        None => turns.len(),
    };
    let store_bytes = store_path
        .and_then(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .unwrap_or(0);

    Ok(MemoryStats {
        store: store_stats,
        log_turns: turns.len(),
        pending_turns,
        last_consolidated,
        store_bytes,
    })
}

pub fn print_stats(stats: &MemoryStats, data_dir: &Path) {
    println!("Memory Harness: Stats");
    println!("======================");
    println!();
    println!("  Data dir:      {}", data_dir.display());
    println!("  Store size:    {}", format_bytes(stats.store_bytes));
    match stats.store.dims {
        Some(d) => println!("  Dimensions:    {}", d),
        None => println!("  Dimensions:    -"),
    }
    println!();
    println!("  Records:       {}", stats.store.total_records);
    println!("    code:         {}", stats.store.code_records);
    println!("    conversation: {}", stats.store.conversation_records);
    println!("  Sources:       {}", stats.store.distinct_sources);
    println!();
    println!("  Log turns:     {}", stats.log_turns);
    println!("  Pending:       {}", stats.pending_turns);
    println!(
        "  Consolidated:  {}",
        stats
            .last_consolidated
            .map(format_relative)
            .unwrap_or_else(|| "never".to_string())
    );
    println!();
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// "3 hours ago" for recent times, a date otherwise.
fn format_relative(ts: DateTime<Utc>) -> String {
    let delta = (Utc::now() - ts).num_seconds();
    let iso = || ts.format("%Y-%m-%d %H:%M").to_string();

    if delta < 0 {
        iso()
    } else if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        iso()
    }
}
