//! Wiring: builds the store, provider, log, indexer and retriever from a
//! [`Config`], so every CLI command and the wake session share one setup.
//!
//! [`Harness::open`] takes the data directory lock ([`DataDirLock`]) and
//! keeps it until the harness is dropped. [`Harness::open_read_only`] does
//! not, for commands that only query.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

use memory_harness_core::embedding::EmbeddingProvider;
use memory_harness_core::store::memory::InMemoryStore;
use memory_harness_core::store::VectorStore;
use memory_harness_core::MemoryError;

use crate::config::Config;
use crate::embedding::create_provider;
use crate::episodic::EpisodicLog;
use crate::indexer::{Indexer, IndexerSettings};
use crate::inference::CompletionBackend;
use crate::lock::DataDirLock;
use crate::retriever::Retriever;
use crate::scan::ProjectScanner;
use crate::session::{SessionController, SessionParts};
use crate::sqlite_store::SqliteStore;

pub struct Harness {
    pub config: Config,
    pub store: Arc<dyn VectorStore>,
    pub provider: Arc<dyn EmbeddingProvider>,
    pub log: Arc<EpisodicLog>,
    pub indexer: Arc<Indexer>,
    /// Set when the on-disk store was corrupt and has been replaced.
    pub recovered_from: Option<MemoryError>,
    _lock: Option<DataDirLock>,
}

impl Harness {
    pub async fn open(config: Config) -> Result<Self> {
        let provider = create_provider(&config.embedding)?;
        Self::open_with_provider(config, provider).await
    }

    /// Open without the data directory lock.
    pub async fn open_read_only(config: Config) -> Result<Self> {
        let provider = create_provider(&config.embedding)?;
        std::fs::create_dir_all(&config.storage.data_dir)?;
        Self::build(config, provider, None).await
    }

    pub async fn open_with_provider(
        config: Config,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.storage.data_dir)?;
        let lock = DataDirLock::acquire(&config.storage.data_dir)?;
        Self::build(config, provider, Some(lock)).await
    }

    async fn build(
        config: Config,
        provider: Arc<dyn EmbeddingProvider>,
        lock: Option<DataDirLock>,
    ) -> Result<Self> {
        let (store, recovered_from): (Arc<dyn VectorStore>, _) =
            match config.storage.backend.as_str() {
                "memory" => (Arc::new(InMemoryStore::default()), None),
                _ => {
                    let mut sqlite = SqliteStore::open(&config.vectors_path()).await?;
                    let recovered = sqlite.take_recovered();
                    (Arc::new(sqlite), recovered)
                }
            };

        let log = Arc::new(EpisodicLog::open(
            &config.log_path(),
            &config.checkpoint_path(),
        )?);
        let scanner = ProjectScanner::new(&config.project, &config.storage.data_dir)?;
        let indexer = Arc::new(Indexer::new(
            store.clone(),
            provider.clone(),
            scanner,
            log.clone(),
            IndexerSettings::from_config(&config),
        ));

        // The replacement store holds none of the consolidated turns, so the
        // next sleep must start from the beginning of the log.
        if recovered_from.is_some() && log.clear_checkpoint()? {
            warn!("consolidation checkpoint reset; the next sleep re-consolidates the whole log");
        }

        if !config.embedding.is_enabled() {
            warn!("embedding provider disabled; indexing and recall will be skipped");
        }

        Ok(Self {
            config,
            store,
            provider,
            log,
            indexer,
            recovered_from,
            _lock: lock,
        })
    }

    /// Close the store. Call before exit so SQLite checkpoints its WAL.
    pub async fn close(&self) {
        self.store.close().await;
    }

    pub fn retriever(&self) -> Retriever {
        Retriever::new(
            self.store.clone(),
            self.provider.clone(),
            self.config.retrieval.params(),
        )
    }

    pub fn session(&self, backend: Arc<dyn CompletionBackend>) -> SessionController {
        SessionController::new(SessionParts {
            log: self.log.clone(),
            indexer: self.indexer.clone(),
            retriever: self.retriever(),
            backend,
            debounce: Duration::from_millis(self.config.watch.debounce_ms),
            context_turns: self.config.inference.context_turns,
            system_prompt: self.config.inference.system_prompt.clone(),
        })
    }
}
