//! Configuration parsing and validation.
//!
//! Memory Harness reads a TOML file (default `./config/mem.toml`). Every
//! section is optional; a missing file means all defaults. After parsing,
//! a few environment variables override the file, then the result is
//! validated.
//!
//! # Example
//!
//! ```toml
//! [storage]
//! data_dir = "./data"
//!
//! [project]
//! root = "."
//!
//! [chunking]
//! max_tokens = 200
//! overlap_tokens = 20
//!
//! [retrieval]
//! top_k = 5
//! min_similarity = 0.2
//! max_context_tokens = 1500
//!
//! [embedding]
//! provider = "ollama"
//! model = "nomic-embed-text"
//! dims = 768
//!
//! [inference]
//! backend = "ollama"
//! text_model = "llama3"
//! vision_model = "llava"
//! ```
//!
//! # Environment overrides
//!
//! | Variable | Overrides |
//! |----------|-----------|
//! | `MEM_DATA_DIR` | `storage.data_dir` |
//! | `MEM_PROJECT_ROOT` | `project.root` |
//! | `MEM_LOG_LEVEL` | `logging.level` |

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use memory_harness_core::retrieve::RetrievalParams;

/// Default config location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/mem.toml";

pub const VECTORS_FILE: &str = "vectors.sqlite";
pub const LOG_FILE: &str = "session_log.jsonl";
pub const CHECKPOINT_FILE: &str = "consolidation.checkpoint";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub project: ProjectConfig,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub embedding: EmbeddingConfig,
    pub consolidation: ConsolidationConfig,
    pub watch: WatchConfig,
    pub inference: InferenceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// Holds the vector store, the episodic log and the checkpoint.
    pub data_dir: PathBuf,
    /// `sqlite` (persistent) or `memory` (lost on exit).
    pub backend: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            backend: "sqlite".into(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProjectConfig {
    pub root: PathBuf,
    pub include_globs: Vec<String>,
    pub exclude_globs: Vec<String>,
    /// Larger files are skipped.
    pub max_file_bytes: u64,
    pub follow_symlinks: bool,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            include_globs: [
                "py", "md", "txt", "js", "ts", "html", "css", "json", "rs", "toml",
            ]
            .iter()
            .map(|ext| format!("**/*.{}", ext))
            .collect(),
            exclude_globs: [
                ".git",
                "__pycache__",
                "venv",
                ".venv",
                "node_modules",
                ".idea",
                ".vscode",
                "target",
            ]
            .iter()
            .map(|dir| format!("**/{}/**", dir))
            .collect(),
            max_file_bytes: 50_000,
            follow_symlinks: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: 200,
            overlap_tokens: 20,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub min_similarity: f32,
    pub max_context_tokens: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        let p = RetrievalParams::default();
        Self {
            top_k: p.top_k,
            min_similarity: p.min_similarity,
            max_context_tokens: p.max_context_tokens,
        }
    }
}

impl RetrievalConfig {
    pub fn params(&self) -> RetrievalParams {
        RetrievalParams {
            top_k: self.top_k,
            min_similarity: self.min_similarity,
            max_context_tokens: self.max_context_tokens,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `hash`, `ollama`, `openai` or `disabled`.
    pub provider: String,
    pub model: Option<String>,
    pub dims: Option<usize>,
    /// Base URL for `ollama` (default `http://localhost:11434`) or an
    /// OpenAI-compatible endpoint.
    pub url: Option<String>,
    pub batch_size: usize,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hash".into(),
            model: None,
            dims: Some(384),
            url: None,
            batch_size: 32,
            max_retries: 3,
            timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// A pause longer than this splits one session into two conversations.
    pub session_gap_minutes: i64,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            session_gap_minutes: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WatchConfig {
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { debounce_ms: 500 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct InferenceConfig {
    /// `ollama` or `disabled`.
    pub backend: String,
    pub url: String,
    pub text_model: String,
    pub vision_model: String,
    /// Messages of history sent with each request, besides the system prompt.
    pub context_turns: usize,
    pub system_prompt: String,
    pub timeout_secs: u64,
    /// Print the reply as the model produces it instead of all at once.
    pub stream: bool,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            backend: "ollama".into(),
            url: "http://localhost:11434".into(),
            text_model: "llama3".into(),
            vision_model: "llava".into(),
            context_turns: 10,
            system_prompt: "You are a helpful local assistant with long-term memory of this \
                            project. Use the provided memory when it is relevant."
                .into(),
            timeout_secs: 120,
            stream: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// An `EnvFilter` directive such as `info` or `memory_harness=debug`.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl Config {
    pub fn vectors_path(&self) -> PathBuf {
        self.storage.data_dir.join(VECTORS_FILE)
    }

    pub fn log_path(&self) -> PathBuf {
        self.storage.data_dir.join(LOG_FILE)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.storage.data_dir.join(CHECKPOINT_FILE)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MEM_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("MEM_PROJECT_ROOT") {
            self.project.root = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("MEM_LOG_LEVEL") {
            self.logging.level = val;
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.storage.backend.as_str() {
            "sqlite" | "memory" => {}
            other => bail!(
                "Unknown storage backend: '{}'. Must be sqlite or memory.",
                other
            ),
        }

        if self.chunking.max_tokens == 0 {
            bail!("chunking.max_tokens must be > 0");
        }
        if self.chunking.overlap_tokens >= self.chunking.max_tokens {
            bail!("chunking.overlap_tokens must be smaller than chunking.max_tokens");
        }

        if self.retrieval.top_k < 1 {
            bail!("retrieval.top_k must be >= 1");
        }
        if !(-1.0..=1.0).contains(&self.retrieval.min_similarity) {
            bail!("retrieval.min_similarity must be in [-1.0, 1.0]");
        }
        if self.retrieval.max_context_tokens == 0 {
            bail!("retrieval.max_context_tokens must be > 0");
        }

        let emb = &self.embedding;
        match emb.provider.as_str() {
            "disabled" => {}
            "hash" => {
                if emb.dims.unwrap_or(0) == 0 {
                    bail!("embedding.dims must be > 0 when provider is 'hash'");
                }
            }
            "ollama" | "openai" => {
                if emb.model.is_none() {
                    bail!(
                        "embedding.model must be specified when provider is '{}'",
                        emb.provider
                    );
                }
                if emb.dims.unwrap_or(0) == 0 {
                    bail!(
                        "embedding.dims must be > 0 when provider is '{}'",
                        emb.provider
                    );
                }
            }
            other => bail!(
                "Unknown embedding provider: '{}'. Must be hash, ollama, openai, or disabled.",
                other
            ),
        }
        if emb.is_enabled() && emb.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }

        if self.consolidation.session_gap_minutes < 1 {
            bail!("consolidation.session_gap_minutes must be >= 1");
        }

        match self.inference.backend.as_str() {
            "ollama" | "disabled" => {}
            other => bail!(
                "Unknown inference backend: '{}'. Must be ollama or disabled.",
                other
            ),
        }

        Ok(())
    }
}

/// Load config from `path` (defaults if the file is absent), apply
/// environment overrides, and validate.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        parse_config(&content)?
    } else {
        info!("no config file at {}, using defaults", path.display());
        Config::default()
    };

    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).context("Failed to parse config file")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.storage.backend, "sqlite");
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.project.max_file_bytes, 50_000);
        assert_eq!(config.inference.context_turns, 10);
        assert!(config.inference.stream);
        assert!(config.vectors_path().ends_with("vectors.sqlite"));
        assert!(config.log_path().ends_with("session_log.jsonl"));
        assert!(config
            .project
            .include_globs
            .contains(&"**/*.py".to_string()));
    }

    #[test]
    fn parse_partial_toml() {
        let config = parse_config(
            r#"
[storage]
data_dir = "/tmp/mem"

[retrieval]
top_k = 8
"#,
        )
        .unwrap();
        assert_eq!(config.storage.data_dir, PathBuf::from("/tmp/mem"));
        assert_eq!(config.retrieval.top_k, 8);
        assert_eq!(config.retrieval.max_context_tokens, 1500);
        assert_eq!(config.chunking.max_tokens, 200);
        assert!(config.inference.stream);
    }

    #[test]
    fn example_config_is_valid() {
        let config = parse_config(include_str!("../config/mem.example.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.embedding.provider, "ollama");
        assert_eq!(config.embedding.dims, Some(768));
        assert_eq!(config.inference.vision_model, "llava");
    }

    #[test]
    fn rejects_bad_values() {
        let mut c = Config::default();
        c.chunking.overlap_tokens = c.chunking.max_tokens;
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.retrieval.top_k = 0;
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.retrieval.min_similarity = 1.5;
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.embedding.provider = "ollama".into();
        assert!(c.validate().is_err(), "ollama needs a model");

        let mut c = Config::default();
        c.embedding.provider = "word2vec".into();
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.inference.backend = "gpt".into();
        assert!(c.validate().is_err());
    }

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.retrieval.top_k, 5);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = Config::default();
        std::env::set_var("MEM_DATA_DIR", "/tmp/override-data");
        std::env::set_var("MEM_LOG_LEVEL", "trace");

        config.apply_env_overrides();

        assert_eq!(config.storage.data_dir, PathBuf::from("/tmp/override-data"));
        assert_eq!(config.logging.level, "trace");

        std::env::remove_var("MEM_DATA_DIR");
        std::env::remove_var("MEM_LOG_LEVEL");
    }
}
