//! Live watch bridge: file-system events to incremental re-indexing.
//!
//! State machine: `Idle → Watching(root) → Idle`. Only one root is watched
//! at a time; watching a new root replaces the old one.
//!
//! The `notify` watcher's callback runs on notify's own thread and only
//! pushes changed paths into an unbounded channel. A single tokio task
//! drains that channel and debounces per path on the trailing edge: each
//! event pushes the path's deadline out to `now + window`, and the path is
//! handed to the [`ReindexSink`] once its deadline passes without another
//! event. Re-indexing runs on that task, one path at a time, in deadline
//! order.
//!
//! [`WatchBridge::stop`] drops the watcher, signals the task, and waits for
//! it. A re-index already running finishes; paths still waiting out their
//! debounce window are discarded.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Receives debounced paths.
#[async_trait]
pub trait ReindexSink: Send + Sync + 'static {
    async fn reindex(&self, path: PathBuf);
}

/// Observable bridge state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchState {
    Idle,
    Watching(PathBuf),
}

struct ActiveWatch {
    root: PathBuf,
    watcher: RecommendedWatcher,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct WatchBridge {
    sink: Arc<dyn ReindexSink>,
    window: Duration,
    active: Option<ActiveWatch>,
}

impl WatchBridge {
    pub fn new(sink: Arc<dyn ReindexSink>, window: Duration) -> Self {
        Self {
            sink,
            window,
            active: None,
        }
    }

    pub fn state(&self) -> WatchState {
        match &self.active {
            Some(a) => WatchState::Watching(a.root.clone()),
            None => WatchState::Idle,
        }
    }

    /// Start watching `root` recursively, replacing any current watch.
    ///
    /// If `root` cannot be watched the current watch is left running.
    /// Must be called from within a tokio runtime.
    pub async fn watch(&mut self, root: &Path) -> Result<PathBuf> {
        let root = root
            .canonicalize()
            .with_context(|| format!("Cannot watch {}", root.display()))?;
        if !root.is_dir() {
            anyhow::bail!("Cannot watch {}: not a directory", root.display());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Access(_)) {
                        return;
                    }
                    for path in event.paths {
                        let _ = tx.send(path);
                    }
                }
                Err(e) => warn!(error = %e, "file watcher error"),
            },
            notify::Config::default(),
        )?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .with_context(|| format!("Cannot watch {}", root.display()))?;

        self.stop().await;

        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = spawn_debouncer(rx, self.window, self.sink.clone(), shutdown_rx);
        info!(root = %root.display(), "watching");
        self.active = Some(ActiveWatch {
            root: root.clone(),
            watcher,
            shutdown,
            task,
        });
        Ok(root)
    }

    /// Return to `Idle`. Returns whether a watch was active.
    pub async fn stop(&mut self) -> bool {
        let Some(active) = self.active.take() else {
            return false;
        };
        drop(active.watcher);
        let _ = active.shutdown.send(());
        if let Err(e) = active.task.await {
            warn!(error = %e, "watch task ended abnormally");
        }
        info!(root = %active.root.display(), "stopped watching");
        true
    }
}

/// Spawn the debouncing consumer.
///
/// Runs until `shutdown` fires or every sender of `events` is dropped;
/// either way, paths still inside their window are discarded.
pub fn spawn_debouncer(
    mut events: mpsc::UnboundedReceiver<PathBuf>,
    window: Duration,
    sink: Arc<dyn ReindexSink>,
    mut shutdown: oneshot::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut pending: HashMap<PathBuf, Instant> = HashMap::new();
        loop {
            let next = pending.values().min().copied();
            let wake_at = next.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                event = events.recv() => match event {
                    Some(path) => {
                        pending.insert(path, Instant::now() + window);
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(wake_at), if next.is_some() => {
                    let now = Instant::now();
                    let mut due: Vec<(PathBuf, Instant)> = pending
                        .iter()
                        .filter(|(_, deadline)| **deadline <= now)
                        .map(|(p, d)| (p.clone(), *d))
                        .collect();
                    due.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
                    for (path, _) in due {
                        pending.remove(&path);
                        sink.reindex(path).await;
                    }
                }
            }
        }
        if !pending.is_empty() {
            debug!(discarded = pending.len(), "discarding pending watch events");
        }
    })
}
