//! Query-time retrieval: embed the query, ask the store, select context.
//!
//! The store is only ever read here. A failed query embedding surfaces as
//! a degraded [`MemoryError`] for the caller to report; an empty bundle is
//! the normal "no relevant memory" answer.

use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use memory_harness_core::embedding::EmbeddingProvider;
use memory_harness_core::models::ChunkKind;
use memory_harness_core::retrieve::{select_context, ContextBundle, RetrievalParams};
use memory_harness_core::store::{RecordFilter, VectorStore};

use crate::embedding::embed_query;

pub struct Retriever {
    store: Arc<dyn VectorStore>,
    provider: Arc<dyn EmbeddingProvider>,
    params: RetrievalParams,
}

impl Retriever {
    pub fn new(
        store: Arc<dyn VectorStore>,
        provider: Arc<dyn EmbeddingProvider>,
        params: RetrievalParams,
    ) -> Self {
        Self {
            store,
            provider,
            params,
        }
    }

    pub fn params(&self) -> &RetrievalParams {
        &self.params
    }

    /// Retrieve with the configured `top_k`.
    pub async fn recall(&self, query: &str, kind: Option<ChunkKind>) -> Result<ContextBundle> {
        self.retrieve(query, self.params.top_k, kind).await
    }

    /// Up to `k` records above the similarity threshold that fit the token
    /// budget, best first.
    pub async fn retrieve(
        &self,
        query: &str,
        k: usize,
        kind: Option<ChunkKind>,
    ) -> Result<ContextBundle> {
        if query.trim().is_empty() || k == 0 {
            return Ok(ContextBundle::default());
        }

        let vector = embed_query(self.provider.as_ref(), query).await?;
        let filter = RecordFilter { kind };
        let candidates = self.store.query(&vector, k, &filter).await?;

        let params = RetrievalParams {
            top_k: k,
            ..self.params
        };
        let bundle = select_context(candidates, &params);
        debug!(
            query,
            results = bundle.len(),
            dropped = bundle.dropped,
            tokens = bundle.total_tokens,
            "retrieved context"
        );
        Ok(bundle)
    }
}
