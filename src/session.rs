//! Session controller: the wake-phase command loop and the sleep cycle.
//!
//! # Commands
//!
//! | Input | Effect |
//! |-------|--------|
//! | `watch:<path>` | watch a directory, re-indexing changed files live |
//! | `unwatch` | stop watching |
//! | `recall:<query>` | show what memory holds for a query |
//! | `img:<path> [prompt]` | describe an image with the vision model |
//! | `sleep` | stop watching, consolidate, re-index, end the session |
//! | `exit` / `quit` | end the session without consolidating |
//! | anything else | a chat turn |
//!
//! # Failure policy
//!
//! A chat turn is logged before anything else happens. If that write
//! fails the error is returned and the turn is not answered;
//! [`run_loop`] reports it and keeps reading. Everything else (retrieval,
//! inference, watching) degrades to a notice and the session carries on.

use std::collections::VecDeque;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{info, warn};
use uuid::Uuid;

use memory_harness_core::models::{ChunkKind, ConsolidationManifest, EpisodicTurn, Role};
use memory_harness_core::retrieve::ContextBundle;
use memory_harness_core::MemoryError;

use crate::episodic::EpisodicLog;
use crate::indexer::Indexer;
use crate::inference::{ChatMessage, CompletionBackend};
use crate::retriever::Retriever;
use crate::watch::{WatchBridge, WatchState};

const DEFAULT_IMAGE_PROMPT: &str = "Describe this image.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Empty,
    Chat(String),
    Watch(String),
    Unwatch,
    Recall(String),
    Image { path: String, prompt: String },
    Sleep,
    Exit,
    /// A recognized command with missing arguments.
    Usage(&'static str),
}

pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    match line.to_ascii_lowercase().as_str() {
        "exit" | "quit" => return Command::Exit,
        "sleep" => return Command::Sleep,
        "unwatch" => return Command::Unwatch,
        _ => {}
    }

    if let Some(rest) = line.strip_prefix("watch:") {
        let path = strip_quotes(rest.trim());
        if path.is_empty() {
            return Command::Usage("usage: watch:<directory>");
        }
        return Command::Watch(path);
    }
    if let Some(rest) = line.strip_prefix("recall:") {
        let query = rest.trim();
        if query.is_empty() {
            return Command::Usage("usage: recall:<query>");
        }
        return Command::Recall(query.to_string());
    }
    if let Some(rest) = line.strip_prefix("img:") {
        let rest = rest.trim_start();
        let (path, prompt) = match rest.split_once(char::is_whitespace) {
            Some((p, q)) if !q.trim().is_empty() => (p, q.trim()),
            Some((p, _)) => (p, DEFAULT_IMAGE_PROMPT),
            None => (rest, DEFAULT_IMAGE_PROMPT),
        };
        let path = strip_quotes(path);
        if path.is_empty() {
            return Command::Usage("usage: img:<path> [prompt]");
        }
        return Command::Image {
            path,
            prompt: prompt.to_string(),
        };
    }

    Command::Chat(line.to_string())
}

/// Drag-and-drop into a terminal often quotes the path.
fn strip_quotes(s: &str) -> String {
    s.chars().filter(|c| *c != '\'' && *c != '"').collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Wake,
    Sleep,
}

/// Something to show the operator.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Agent(String),
    Info(String),
    /// An operation was skipped; the session continues.
    Degraded(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Continue(Vec<Output>),
    Exit(Vec<Output>),
}

/// Everything a session needs, assembled by the caller.
pub struct SessionParts {
    pub log: Arc<EpisodicLog>,
    pub indexer: Arc<Indexer>,
    pub retriever: Retriever,
    pub backend: Arc<dyn CompletionBackend>,
    pub debounce: Duration,
    pub context_turns: usize,
    pub system_prompt: String,
}

pub struct SessionController {
    session_id: String,
    phase: Phase,
    log: Arc<EpisodicLog>,
    indexer: Arc<Indexer>,
    retriever: Retriever,
    backend: Arc<dyn CompletionBackend>,
    bridge: WatchBridge,
    system_prompt: String,
    context_turns: usize,
    history: VecDeque<ChatMessage>,
}

impl SessionController {
    pub fn new(parts: SessionParts) -> Self {
        let bridge = WatchBridge::new(parts.indexer.clone(), parts.debounce);
        Self {
            session_id: Uuid::new_v4().to_string(),
            phase: Phase::Wake,
            log: parts.log,
            indexer: parts.indexer,
            retriever: parts.retriever,
            backend: parts.backend,
            bridge,
            system_prompt: parts.system_prompt,
            context_turns: parts.context_turns.max(1),
            history: VecDeque::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn watch_state(&self) -> WatchState {
        self.bridge.state()
    }

    /// Handle one line of operator input.
    ///
    /// Only an episodic log write failure is returned as an error.
    pub async fn handle(&mut self, line: &str) -> Result<Step> {
        self.handle_streaming(line, &mut |_: &str| {}).await
    }

    /// [`handle`](Self::handle), passing chat reply text to `on_token` as
    /// the backend produces it. The full reply is still returned as
    /// [`Output::Agent`].
    pub async fn handle_streaming(
        &mut self,
        line: &str,
        on_token: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<Step> {
        let step = match parse_command(line) {
            Command::Empty => Step::Continue(Vec::new()),
            Command::Usage(msg) => Step::Continue(vec![Output::Info(msg.to_string())]),
            Command::Chat(text) => Step::Continue(self.chat(&text, on_token).await?),
            Command::Watch(path) => Step::Continue(self.watch(Path::new(&path)).await),
            Command::Unwatch => {
                let msg = if self.bridge.stop().await {
                    "Stopped watching."
                } else {
                    "Not watching anything."
                };
                Step::Continue(vec![Output::Info(msg.to_string())])
            }
            Command::Recall(query) => Step::Continue(vec![self.recall(&query).await]),
            Command::Image { path, prompt } => {
                Step::Continue(self.image(Path::new(&path), &prompt).await?)
            }
            Command::Sleep => {
                let manifest = self.sleep().await?;
                Step::Exit(vec![Output::Info(describe_manifest(&manifest))])
            }
            Command::Exit => {
                self.shutdown().await?;
                Step::Exit(Vec::new())
            }
        };
        Ok(step)
    }

    async fn chat(
        &mut self,
        text: &str,
        on_token: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<Vec<Output>> {
        self.log
            .append_async(EpisodicTurn::new(&self.session_id, Role::User, text))
            .await?;

        let mut out = Vec::new();
        let bundle = match self.retriever.recall(text, None).await {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "memory retrieval failed");
                out.push(Output::Degraded(format!("Memory unavailable: {:#}", e)));
                ContextBundle::default()
            }
        };

        self.remember(ChatMessage::user(text));
        let messages = self.window();
        match self
            .backend
            .complete_streaming(&messages, &bundle, on_token)
            .await
        {
            Ok(reply) => {
                let paths: Vec<String> = bundle
                    .items
                    .iter()
                    .filter(|i| i.kind == ChunkKind::Code)
                    .map(|i| i.source_path.clone())
                    .collect();
                self.log
                    .append_async(
                        EpisodicTurn::new(&self.session_id, Role::Agent, reply.as_str())
                            .with_paths(paths),
                    )
                    .await?;
                self.remember(ChatMessage::assistant(reply.as_str()));
                out.push(Output::Agent(reply));
            }
            Err(e) => {
                warn!(backend = self.backend.name(), error = %format!("{:#}", e), "completion failed");
                out.push(Output::Degraded(format!("No reply: {:#}", e)));
            }
        }
        Ok(out)
    }

    async fn image(&mut self, path: &Path, prompt: &str) -> Result<Vec<Output>> {
        if !path.is_file() {
            return Ok(vec![Output::Degraded(format!(
                "Image not found: {}",
                path.display()
            ))]);
        }

        let description = match self.backend.describe_image(path, prompt).await {
            Ok(d) => d,
            Err(e) => {
                warn!(image = %path.display(), error = %format!("{:#}", e), "image description failed");
                return Ok(vec![Output::Degraded(format!("No description: {:#}", e))]);
            }
        };

        let shown = path.display().to_string();
        self.log
            .append_async(
                EpisodicTurn::new(
                    &self.session_id,
                    Role::User,
                    format!("[Image: {}] {}", shown, prompt),
                )
                .with_image(shown.as_str()),
            )
            .await?;
        self.log
            .append_async(
                EpisodicTurn::new(&self.session_id, Role::Agent, description.as_str())
                    .with_image(shown.as_str()),
            )
            .await?;
        self.remember(ChatMessage::user(format!(
            "I just showed you an image. Analysis: {}",
            description
        )));
        Ok(vec![Output::Agent(description)])
    }

    async fn watch(&mut self, path: &Path) -> Vec<Output> {
        match self.bridge.watch(path).await {
            Ok(root) => {
                let mut out = vec![Output::Info(format!("Watching {}", root.display()))];
                if self.indexer.scanner().relative(&root).is_none() {
                    out.push(Output::Degraded(format!(
                        "{} is outside the project root {}; its changes will not be indexed",
                        root.display(),
                        self.indexer.scanner().root().display()
                    )));
                }
                out
            }
            Err(e) => vec![Output::Degraded(format!("{:#}", e))],
        }
    }

    async fn recall(&self, query: &str) -> Output {
        match self.retriever.recall(query, None).await {
            Ok(bundle) if bundle.is_empty() => Output::Info("No relevant memory.".into()),
            Ok(bundle) => Output::Info(bundle.render()),
            Err(e) => {
                warn!(error = %format!("{:#}", e), "recall failed");
                Output::Degraded(format!("Memory unavailable: {:#}", e))
            }
        }
    }

    /// Enter the sleep phase: stop watching, flush the log, then
    /// consolidate and re-index.
    /// A failed flush leaves the session awake.
    pub async fn sleep(&mut self) -> Result<ConsolidationManifest> {
        self.phase = Phase::Sleep;
        self.bridge.stop().await;
        let result = run_sleep_cycle(&self.indexer, &self.log).await;
        if result.is_err() {
            self.phase = Phase::Wake;
        }
        result
    }

    /// End the session without consolidating.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.bridge.stop().await;
        self.log.flush_async().await?;
        info!(session = %self.session_id, "session ended");
        Ok(())
    }

    fn remember(&mut self, message: ChatMessage) {
        self.history.push_back(message);
        while self.history.len() > self.context_turns {
            self.history.pop_front();
        }
    }

    /// System prompt plus the most recent messages.
    fn window(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.history.len() + 1);
        messages.push(ChatMessage::system(self.system_prompt.as_str()));
        messages.extend(self.history.iter().cloned());
        messages
    }
}

/// Drive a wake session from `input` until it ends, writing to `out`.
///
/// A chat or image turn that could not be logged is reported and the loop
/// keeps reading. Any other error shuts the session down before it is
/// returned. End of input and Ctrl-C end the session like `exit`.
pub async fn run_loop<R, W>(session: &mut SessionController, input: R, out: &mut W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: Write + Send,
{
    let mut lines = input.lines();
    loop {
        write!(out, "> ")?;
        out.flush()?;
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            writeln!(out)?;
            return session.shutdown().await;
        };

        let mut streamed = false;
        let result = {
            let mut on_token = |piece: &str| {
                if !streamed {
                    let _ = write!(out, "agent: ");
                    streamed = true;
                }
                let _ = write!(out, "{}", piece);
                let _ = out.flush();
            };
            session.handle_streaming(&line, &mut on_token).await
        };
        if streamed {
            writeln!(out)?;
        }

        let step = match result {
            Ok(step) => step,
            Err(e) if is_unlogged_turn(&line, &e) => {
                warn!(error = %format!("{:#}", e), "turn not recorded");
                writeln!(out, "[error] {:#}; the turn was not recorded", e)?;
                continue;
            }
            Err(e) => {
                if let Err(shutdown) = session.shutdown().await {
                    warn!(error = %format!("{:#}", shutdown), "shutdown after error failed");
                }
                return Err(e);
            }
        };
        match step {
            Step::Continue(outputs) => show(out, &outputs, streamed)?,
            Step::Exit(outputs) => {
                show(out, &outputs, streamed)?;
                return Ok(());
            }
        }
    }
}

fn is_unlogged_turn(line: &str, err: &anyhow::Error) -> bool {
    matches!(
        parse_command(line),
        Command::Chat(_) | Command::Image { .. }
    ) && matches!(
        MemoryError::find(err),
        Some(MemoryError::LogWriteFailure(_))
    )
}

/// Print outputs. A streamed reply is already on screen.
fn show<W: Write>(out: &mut W, outputs: &[Output], streamed: bool) -> std::io::Result<()> {
    for output in outputs {
        match output {
            Output::Agent(_) if streamed => {}
            Output::Agent(text) => writeln!(out, "agent: {}", text)?,
            Output::Info(text) => writeln!(out, "{}", text.trim_end())?,
            Output::Degraded(text) => writeln!(out, "[degraded] {}", text)?,
        }
    }
    Ok(())
}

/// The sleep cycle: consolidate new episodic turns, then reconcile the
/// project tree. The caller must have stopped any watch first.
///
/// A failing step is recorded in the manifest's diagnostics and the other
/// step still runs. Only a log flush failure is returned as an error.
pub async fn run_sleep_cycle(indexer: &Indexer, log: &EpisodicLog) -> Result<ConsolidationManifest> {
    log.flush()?;
    let mut manifest = ConsolidationManifest::default();

    match indexer.consolidate().await {
        Ok(m) => manifest.merge(m),
        Err(e) => {
            warn!(error = %format!("{:#}", e), "consolidation failed; will retry next sleep");
            manifest
                .diagnostics
                .push(format!("consolidation failed: {:#}", e));
        }
    }

    match indexer.index_all().await {
        Ok(m) => manifest.merge(m),
        Err(e) => {
            warn!(error = %format!("{:#}", e), "project index failed");
            manifest.diagnostics.push(format!("indexing failed: {:#}", e));
        }
    }

    Ok(manifest)
}

/// One-paragraph summary of a sleep cycle.
pub fn describe_manifest(m: &ConsolidationManifest) -> String {
    let mut s = format!(
        "Consolidated {} turns into {} conversations. Indexed {} files ({} skipped): \
         {} chunks added, {} updated, {} unchanged, {} removed, {} embedding calls.",
        m.turns_stored,
        m.conversations,
        m.files_indexed,
        m.files_skipped,
        m.chunks_added,
        m.chunks_updated,
        m.chunks_unchanged,
        m.chunks_removed,
        m.embedding_calls
    );
    for d in &m.diagnostics {
        s.push_str("\n  ");
        s.push_str(d);
    }
    s
}
