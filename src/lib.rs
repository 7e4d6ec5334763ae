//! # Memory Harness
//!
//! A local-first long-term memory for a coding agent.
//!
//! The agent alternates between two phases. While **awake** it chats,
//! watches a working directory, and answers with relevant memory injected
//! into the model's context; every turn is durably appended to the
//! episodic log. While **asleep** it consolidates the new turns into
//! conversation records and re-indexes the project tree, so the next wake
//! session can recall both.
//!
//! ## Architecture
//!
//! ```text
//!            wake                               sleep
//! ┌──────────────────────┐        ┌───────────────────────────────┐
//! │ SessionController    │        │ Indexer::consolidate          │
//! │  ├─ EpisodicLog ─────┼───────▶│   (log since checkpoint)      │
//! │  ├─ Retriever ◀──┐   │        │ Indexer::index_all            │
//! │  └─ WatchBridge ─┼─┐ │        │   (project tree)              │
//! └──────────────────┼─┼─┘        └──────────────┬────────────────┘
//!                    │ ▼ Indexer::index_path     ▼
//!                 ┌──┴──────────────────────────────┐
//!                 │ VectorStore (SQLite / memory)   │
//!                 └─────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] / [`migrate`] | SQLite connection and schema |
//! | [`sqlite_store`] | Persistent vector store |
//! | [`embedding`] | Embedding providers |
//! | [`scan`] | Project file selection |
//! | [`episodic`] | Durable interaction log |
//! | [`indexer`] | Indexing and consolidation |
//! | [`retriever`] | Query-time context selection |
//! | [`watch`] | Live re-indexing of a watched directory |
//! | [`inference`] | Language-model backends |
//! | [`session`] | Wake-phase commands and the sleep cycle |
//! | [`harness`] | Wiring from config |
//! | [`lock`] | One writer per data directory |
//! | [`stats`] | Memory statistics |

pub mod config;
pub mod db;
pub mod embedding;
pub mod episodic;
pub mod harness;
pub mod indexer;
pub mod inference;
pub mod lock;
pub mod migrate;
pub mod retriever;
pub mod scan;
pub mod session;
pub mod sqlite_store;
pub mod stats;
pub mod watch;
