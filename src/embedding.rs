//! Embedding provider implementations.
//!
//! - **`hash`**: [`HashingProvider`] from the core crate. Offline and
//!   deterministic; the default so a fresh install works without a model
//!   server.
//! - **`ollama`**: [`OllamaProvider`], `POST /api/embed` on a local Ollama.
//! - **`openai`**: [`OpenAIProvider`], `POST /v1/embeddings` on the OpenAI
//!   API or any compatible endpoint.
//! - **`disabled`**: [`DisabledProvider`], every call fails with
//!   `ProviderUnavailable`.
//!
//! # Retry Strategy
//!
//! The HTTP providers use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! Whatever the cause, a provider that gives up returns
//! [`MemoryError::ProviderUnavailable`], and a response that does not hold
//! one finite vector of the configured size per input returns
//! [`MemoryError::InvalidEmbedding`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tracing::debug;

use memory_harness_core::embedding::{validate_embeddings, EmbeddingProvider, HashingProvider};
use memory_harness_core::MemoryError;

use crate::config::EmbeddingConfig;

/// Build the provider named by `embedding.provider`.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "hash" => Ok(Arc::new(HashingProvider::new(config.dims.unwrap_or(384)))),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Embed `texts` in batches of `batch_size`, preserving order.
///
/// Returns the vectors and the number of provider calls made.
pub async fn embed_in_batches(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
    batch_size: usize,
) -> Result<(Vec<Vec<f32>>, u64)> {
    let mut vectors = Vec::with_capacity(texts.len());
    let mut calls = 0u64;
    for batch in texts.chunks(batch_size.max(1)) {
        let out = provider.embed(batch).await?;
        calls += 1;
        validate_embeddings(&out, batch.len(), provider.dims())?;
        vectors.extend(out);
    }
    Ok((vectors, calls))
}

/// Embed a single query text.
pub async fn embed_query(provider: &dyn EmbeddingProvider, text: &str) -> Result<Vec<f32>> {
    let (mut vectors, _) = embed_in_batches(provider, &[text.to_string()], 1).await?;
    vectors
        .pop()
        .ok_or_else(|| MemoryError::InvalidEmbedding("empty embedding response".into()).into())
}

// ============ Disabled Provider ============

/// Used when `embedding.provider = "disabled"`. Indexing and recall run in
/// degraded mode.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(MemoryError::ProviderUnavailable("embedding provider is disabled".into()).into())
    }
}

// ============ HTTP plumbing ============

struct HttpSettings {
    client: reqwest::Client,
    max_retries: u32,
}

impl HttpSettings {
    fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            max_retries: config.max_retries,
        })
    }

    /// POST `body` to `url` with retry/backoff; the parsed JSON on success.
    async fn post_json(
        &self,
        label: &str,
        url: &str,
        bearer: Option<&str>,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let mut last_err = String::new();

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                debug!(provider = label, attempt, ?delay, "retrying embedding request");
                tokio::time::sleep(delay).await;
            }

            let mut req = self.client.post(url).json(body);
            if let Some(token) = bearer {
                req = req.bearer_auth(token);
            }

            match req.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return response.json().await.map_err(|e| {
                            MemoryError::InvalidEmbedding(format!("{} response: {}", label, e))
                                .into()
                        });
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    last_err = format!("{} API error {}: {}", label, status, body_text);
                    if status.as_u16() == 429 || status.is_server_error() {
                        continue;
                    }
                    break;
                }
                Err(e) => {
                    last_err = format!("{} connection error (is it running at {}?): {}", label, url, e);
                    continue;
                }
            }
        }

        Err(MemoryError::ProviderUnavailable(last_err).into())
    }
}

fn json_vector(value: &serde_json::Value, what: &str) -> Result<Vec<f32>> {
    value
        .as_array()
        .ok_or_else(|| MemoryError::InvalidEmbedding(format!("{} is not an array", what)))?
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| anyhow!(MemoryError::InvalidEmbedding(format!("{} holds a non-number", what))))
        })
        .collect()
}

// ============ Ollama Provider ============

/// Embeddings from a local Ollama instance.
///
/// Requires an embedding model to be pulled (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
    http: HttpSettings,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            model,
            dims,
            url: url.trim_end_matches('/').to_string(),
            http: HttpSettings::new(config)?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = self
            .http
            .post_json("Ollama", &format!("{}/api/embed", self.url), None, &body)
            .await?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| MemoryError::InvalidEmbedding("Ollama response missing embeddings array".into()))?
        .iter()
        .map(|e| json_vector(e, "Ollama embedding"))
        .collect()
}

// ============ OpenAI Provider ============

/// Embeddings from the OpenAI API (or a compatible endpoint via
/// `embedding.url`). Requires `OPENAI_API_KEY`.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    url: String,
    api_key: String,
    http: HttpSettings,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        Ok(Self {
            model,
            dims,
            url: url.trim_end_matches('/').to_string(),
            api_key,
            http: HttpSettings::new(config)?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = self
            .http
            .post_json(
                "OpenAI",
                &format!("{}/embeddings", self.url),
                Some(&self.api_key),
                &body,
            )
            .await?;
        parse_openai_response(&json)
    }
}

/// Extract `data[].embedding`, ordered by `data[].index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| MemoryError::InvalidEmbedding("OpenAI response missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| MemoryError::InvalidEmbedding("OpenAI response missing embedding".into()))?;
        indexed.push((index, json_vector(embedding, "OpenAI embedding")?));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}
