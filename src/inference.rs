//! Language-model inference boundary.
//!
//! The memory subsystem only supplies context; generating text is the
//! backend's job. Two backends:
//!
//! - **`ollama`**: [`OllamaBackend`]. Chat completion via `POST /api/chat`
//!   with the text model; image description via `POST /api/generate` with
//!   the vision model and the image as base64. With `inference.stream` on,
//!   chat replies arrive as newline-delimited JSON and are handed out
//!   piece by piece.
//! - **`disabled`**: [`DisabledBackend`], every call fails with
//!   `ProviderUnavailable`.
//!
//! Retrieved memory is injected by [`with_context`] as a system message
//! placed just before the newest message.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::debug;

use memory_harness_core::retrieve::ContextBundle;
use memory_harness_core::MemoryError;

use crate::config::InferenceConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Complete a chat, with `context` made available to the model.
    async fn complete(&self, messages: &[ChatMessage], context: &ContextBundle) -> Result<String>;

    /// Like [`complete`](Self::complete), passing each piece of the reply
    /// to `on_token` as it is generated. Backends that cannot stream hand
    /// over the whole reply at once.
    async fn complete_streaming(
        &self,
        messages: &[ChatMessage],
        context: &ContextBundle,
        on_token: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<String> {
        let reply = self.complete(messages, context).await?;
        on_token(&reply);
        Ok(reply)
    }

    /// Describe an image file in answer to `prompt`.
    async fn describe_image(&self, image: &Path, prompt: &str) -> Result<String>;
}

pub fn create_backend(config: &InferenceConfig) -> Result<Arc<dyn CompletionBackend>> {
    match config.backend.as_str() {
        "disabled" => Ok(Arc::new(DisabledBackend)),
        "ollama" => Ok(Arc::new(OllamaBackend::new(config)?)),
        other => bail!("Unknown inference backend: {}", other),
    }
}

/// `messages` with the rendered context inserted before the last message.
/// An empty bundle leaves the messages as they are.
pub fn with_context(messages: &[ChatMessage], context: &ContextBundle) -> Vec<ChatMessage> {
    let mut out = messages.to_vec();
    if context.is_empty() {
        return out;
    }
    let at = out.len().saturating_sub(1);
    out.insert(at, ChatMessage::system(context.render()));
    out
}

pub struct DisabledBackend;

#[async_trait]
impl CompletionBackend for DisabledBackend {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _messages: &[ChatMessage], _context: &ContextBundle) -> Result<String> {
        Err(MemoryError::ProviderUnavailable("inference backend is disabled".into()).into())
    }

    async fn describe_image(&self, _image: &Path, _prompt: &str) -> Result<String> {
        Err(MemoryError::ProviderUnavailable("inference backend is disabled".into()).into())
    }
}

/// One line of an Ollama `/api/chat` stream.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct StreamLine {
    pub content: String,
    pub done: bool,
}

#[derive(Deserialize)]
struct RawStreamLine {
    #[serde(default)]
    message: Option<RawStreamMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct RawStreamMessage {
    #[serde(default)]
    content: String,
}

/// Parse one line of a chat stream. Blank lines yield `None`; an `error`
/// field or unparseable JSON is a [`MemoryError::ProviderUnavailable`].
pub fn parse_stream_line(line: &[u8]) -> Result<Option<StreamLine>> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let raw: RawStreamLine = serde_json::from_slice(line).map_err(|e| {
        MemoryError::ProviderUnavailable(format!("Ollama stream: malformed line: {}", e))
    })?;
    if let Some(error) = raw.error {
        return Err(MemoryError::ProviderUnavailable(format!("Ollama stream error: {}", error)).into());
    }
    Ok(Some(StreamLine {
        content: raw.message.map(|m| m.content).unwrap_or_default(),
        done: raw.done,
    }))
}

pub struct OllamaBackend {
    client: reqwest::Client,
    url: String,
    text_model: String,
    vision_model: String,
    stream: bool,
}

impl OllamaBackend {
    pub fn new(config: &InferenceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            text_model: config.text_model.clone(),
            vision_model: config.vision_model.clone(),
            stream: config.stream,
        })
    }

    async fn post(&self, endpoint: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        let response = self.send(endpoint, body).await?;
        response
            .json()
            .await
            .map_err(|e| MemoryError::ProviderUnavailable(format!("Ollama response: {}", e)).into())
    }

    async fn send(&self, endpoint: &str, body: &serde_json::Value) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.url, endpoint);
        let response = self.client.post(&url).json(body).send().await.map_err(|e| {
            MemoryError::ProviderUnavailable(format!(
                "Ollama connection error (is it running at {}?): {}",
                self.url, e
            ))
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(
                MemoryError::ProviderUnavailable(format!("Ollama API error {}: {}", status, text))
                    .into(),
            );
        }
        Ok(response)
    }

    fn chat_body(&self, messages: &[ChatMessage], context: &ContextBundle, stream: bool) -> serde_json::Value {
        let messages = with_context(messages, context);
        debug!(model = %self.text_model, messages = messages.len(), stream, "chat request");
        serde_json::json!({
            "model": self.text_model,
            "messages": messages,
            "stream": stream,
        })
    }
}

#[async_trait]
impl CompletionBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn complete(&self, messages: &[ChatMessage], context: &ContextBundle) -> Result<String> {
        let body = self.chat_body(messages, context, false);
        let json = self.post("/api/chat", &body).await?;
        json.get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                MemoryError::ProviderUnavailable("Ollama chat response missing message".into())
                    .into()
            })
    }

    async fn complete_streaming(
        &self,
        messages: &[ChatMessage],
        context: &ContextBundle,
        on_token: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<String> {
        if !self.stream {
            let reply = self.complete(messages, context).await?;
            on_token(&reply);
            return Ok(reply);
        }

        let body = self.chat_body(messages, context, true);
        let mut response = self.send("/api/chat", &body).await?;
        let mut pending: Vec<u8> = Vec::new();
        let mut reply = String::new();
        let mut finished = false;

        while !finished {
            let chunk = response.chunk().await.map_err(|e| {
                MemoryError::ProviderUnavailable(format!("Ollama stream interrupted: {}", e))
            })?;
            let Some(chunk) = chunk else { break };
            pending.extend_from_slice(&chunk);
            while let Some(end) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=end).collect();
                if let Some(parsed) = parse_stream_line(&line)? {
                    finished |= take_piece(parsed, &mut reply, on_token);
                }
            }
        }
        if !finished {
            if let Some(parsed) = parse_stream_line(&pending)? {
                finished = take_piece(parsed, &mut reply, on_token);
            }
        }
        if !finished {
            return Err(MemoryError::ProviderUnavailable(
                "Ollama stream ended before the reply was complete".into(),
            )
            .into());
        }
        Ok(reply)
    }

    async fn describe_image(&self, image: &Path, prompt: &str) -> Result<String> {
        let bytes = tokio::fs::read(image)
            .await
            .with_context(|| format!("Failed to read image {}", image.display()))?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        debug!(model = %self.vision_model, image = %image.display(), "vision request");
        let body = serde_json::json!({
            "model": self.vision_model,
            "prompt": prompt,
            "images": [encoded],
            "stream": false,
        });
        let json = self.post("/api/generate", &body).await?;
        json.get("response")
            .and_then(|r| r.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                MemoryError::ProviderUnavailable("Ollama generate response missing text".into())
                    .into()
            })
    }
}

/// Hand a streamed piece to the caller; returns whether the stream is done.
fn take_piece(line: StreamLine, reply: &mut String, on_token: &mut (dyn for<'a> FnMut(&'a str) + Send)) -> bool {
    if !line.content.is_empty() {
        on_token(&line.content);
        reply.push_str(&line.content);
    }
    line.done
}
