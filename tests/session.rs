//! Wake-session behavior with a scripted inference backend.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use memory_harness::config::Config;
use memory_harness::harness::Harness;
use memory_harness::inference::{ChatMessage, ChatRole, CompletionBackend};
use memory_harness::session::{run_loop, Output, Phase, SessionController, Step};
use memory_harness::watch::WatchState;
use memory_harness_core::embedding::HashingProvider;
use memory_harness_core::models::{ChunkKind, Role};
use memory_harness_core::retrieve::ContextBundle;
use memory_harness_core::MemoryError;

#[derive(Default)]
struct ScriptedBackend {
    fail: bool,
    calls: Mutex<Vec<(Vec<ChatMessage>, ContextBundle)>>,
}

impl ScriptedBackend {
    fn calls(&self) -> Vec<(Vec<ChatMessage>, ContextBundle)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, messages: &[ChatMessage], context: &ContextBundle) -> Result<String> {
        let mut calls = self.calls.lock().unwrap();
        calls.push((messages.to_vec(), context.clone()));
        if self.fail {
            return Err(MemoryError::ProviderUnavailable("model offline".into()).into());
        }
        Ok(format!("reply {}", calls.len()))
    }

    async fn describe_image(&self, _image: &Path, prompt: &str) -> Result<String> {
        Ok(format!("a bar chart ({})", prompt))
    }
}

async fn setup(backend: Arc<ScriptedBackend>) -> (TempDir, Harness, SessionController) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().canonicalize().unwrap().join("project");
    fs::create_dir_all(&root).unwrap();
    fs::write(
        root.join("auth.py"),
        "# Authentication logic for the web app\n\
         def login(user, password):\n    return check_password(user, password)\n",
    )
    .unwrap();

    let mut config = Config::default();
    config.storage.data_dir = tmp.path().join("data");
    config.storage.backend = "memory".into();
    config.project.root = root;
    config.inference.context_turns = 2;
    config.watch.debounce_ms = 50;

    let harness = Harness::open_with_provider(config, Arc::new(HashingProvider::new(384)))
        .await
        .unwrap();
    harness.indexer.index_all().await.unwrap();
    let session = harness.session(backend);
    (tmp, harness, session)
}

fn outputs(step: Step) -> Vec<Output> {
    match step {
        Step::Continue(o) => o,
        Step::Exit(o) => panic!("session ended unexpectedly: {:?}", o),
    }
}

#[tokio::test]
async fn chat_turn_is_logged_and_answered_with_memory() {
    let backend = Arc::new(ScriptedBackend::default());
    let (_tmp, harness, mut session) = setup(backend.clone()).await;

    let out = outputs(session.handle("authentication logic?").await.unwrap());
    assert_eq!(out, vec![Output::Agent("reply 1".into())]);

    let turns = harness.log.read_all().unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].role, Role::User);
    assert_eq!(turns[0].session_id, session.session_id());
    assert_eq!(turns[1].role, Role::Agent);
    assert!(turns[1].referenced_paths.contains("auth.py"));

    let calls = backend.calls();
    let (messages, context) = &calls[0];
    assert_eq!(messages[0].role, ChatRole::System);
    assert_eq!(context.items[0].source_path, "auth.py");
}

#[tokio::test]
async fn history_is_a_sliding_window() {
    let backend = Arc::new(ScriptedBackend::default());
    let (_tmp, _harness, mut session) = setup(backend.clone()).await;

    for text in ["first", "second", "third"] {
        session.handle(text).await.unwrap();
    }
    let calls = backend.calls();
    let (last, _) = calls.last().unwrap();
    assert_eq!(last.len(), 3, "system prompt plus two messages");
    assert_eq!(last[0].role, ChatRole::System);
    assert_eq!(last[2], ChatMessage::user("third"));
}

#[tokio::test]
async fn inference_failure_degrades_but_keeps_the_user_turn() {
    let backend = Arc::new(ScriptedBackend {
        fail: true,
        ..Default::default()
    });
    let (_tmp, harness, mut session) = setup(backend).await;

    let out = outputs(session.handle("hello").await.unwrap());
    assert!(matches!(out.as_slice(), [Output::Degraded(_)]));
    let turns = harness.log.read_all().unwrap();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].content, "hello");
}

#[tokio::test]
async fn log_write_failure_is_escalated() {
    let backend = Arc::new(ScriptedBackend::default());
    let (_tmp, harness, mut session) = setup(backend.clone()).await;
    fs::create_dir_all(harness.config.log_path()).unwrap();

    let err = session.handle("hello").await.unwrap_err();
    assert!(matches!(
        MemoryError::find(&err),
        Some(MemoryError::LogWriteFailure(_))
    ));
    assert!(backend.calls().is_empty(), "an unlogged turn is never answered");
}

#[tokio::test]
async fn image_turns_are_logged_with_the_image_path() {
    let backend = Arc::new(ScriptedBackend::default());
    let (tmp, harness, mut session) = setup(backend).await;

    let out = outputs(session.handle("img:/no/such/chart.png").await.unwrap());
    assert!(matches!(out.as_slice(), [Output::Degraded(_)]));
    assert!(harness.log.read_all().unwrap().is_empty());

    let image = tmp.path().join("chart.png");
    fs::write(&image, [0x89, b'P', b'N', b'G']).unwrap();
    let out = outputs(
        session
            .handle(&format!("img:{} What does this show?", image.display()))
            .await
            .unwrap(),
    );
    assert_eq!(
        out,
        vec![Output::Agent("a bar chart (What does this show?)".into())]
    );

    let turns = harness.log.read_all().unwrap();
    assert_eq!(turns.len(), 2);
    assert!(turns[0].content.starts_with("[Image: "));
    for turn in &turns {
        let shown = image.display().to_string();
        assert_eq!(turn.image_path.as_deref(), Some(shown.as_str()));
        assert!(turn.referenced_paths.contains(&shown));
    }
}

#[tokio::test]
async fn recall_and_watch_commands() {
    let backend = Arc::new(ScriptedBackend::default());
    let (tmp, _harness, mut session) = setup(backend).await;

    let out = outputs(session.handle("recall:authentication logic").await.unwrap());
    match out.as_slice() {
        [Output::Info(text)] => assert!(text.contains("auth.py")),
        other => panic!("unexpected output {:?}", other),
    }

    let out = outputs(session.handle("watch:/no/such/dir").await.unwrap());
    assert!(matches!(out.as_slice(), [Output::Degraded(_)]));
    assert_eq!(session.watch_state(), WatchState::Idle);

    let root = tmp.path().canonicalize().unwrap().join("project");
    let out = outputs(
        session
            .handle(&format!("watch:{}", root.display()))
            .await
            .unwrap(),
    );
    assert!(matches!(out.as_slice(), [Output::Info(_)]));
    assert_eq!(session.watch_state(), WatchState::Watching(root));

    let out = outputs(session.handle("unwatch").await.unwrap());
    assert_eq!(out, vec![Output::Info("Stopped watching.".into())]);
    assert_eq!(session.watch_state(), WatchState::Idle);
}

#[tokio::test]
async fn sleep_consolidates_and_ends_the_session() {
    let backend = Arc::new(ScriptedBackend::default());
    let (_tmp, harness, mut session) = setup(backend).await;

    session.handle("how does login work?").await.unwrap();
    match session.handle("sleep").await.unwrap() {
        Step::Exit(out) => match out.as_slice() {
            [Output::Info(summary)] => assert!(summary.starts_with("Consolidated 2 turns")),
            other => panic!("unexpected output {:?}", other),
        },
        Step::Continue(_) => panic!("sleep should end the session"),
    }
    assert_eq!(session.phase(), Phase::Sleep);

    let stats = harness.store.stats().await.unwrap();
    assert_eq!(stats.conversation_records, 1);
    assert_eq!(stats.code_records, 1);
    assert!(harness.log.load_checkpoint().unwrap().is_some());
}

async fn code_sources(harness: &Harness) -> Vec<String> {
    harness
        .store
        .source_paths(Some(ChunkKind::Code))
        .await
        .unwrap()
        .into_iter()
        .collect()
}

/// Poll until `check` holds or a few seconds pass.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watched_edits_reach_the_store() {
    let backend = Arc::new(ScriptedBackend::default());
    let (tmp, harness, mut session) = setup(backend).await;
    let root = tmp.path().canonicalize().unwrap().join("project");
    let h = &harness;

    let out = outputs(
        session
            .handle(&format!("watch:{}", root.display()))
            .await
            .unwrap(),
    );
    assert!(matches!(out.as_slice(), [Output::Info(_)]));

    fs::write(
        root.join("fresh.py"),
        "# Rate limiter for the public API\ndef allow(client):\n    return True\n",
    )
    .unwrap();
    assert!(
        eventually(|| async move { code_sources(h).await.contains(&"fresh.py".to_string()) })
            .await,
        "a new file is indexed while watching"
    );

    fs::remove_file(root.join("fresh.py")).unwrap();
    assert!(
        eventually(|| async move { !code_sources(h).await.contains(&"fresh.py".to_string()) })
            .await,
        "a deleted file leaves the store"
    );
    assert_eq!(code_sources(&harness).await, vec!["auth.py".to_string()]);

    session.handle("unwatch").await.unwrap();
}

#[tokio::test]
async fn unlogged_turn_is_reported_and_the_loop_continues() {
    let backend = Arc::new(ScriptedBackend::default());
    let (_tmp, harness, mut session) = setup(backend.clone()).await;
    fs::create_dir_all(harness.config.log_path()).unwrap();

    let mut out = Vec::new();
    run_loop(
        &mut session,
        "hello\nrecall:authentication logic\nexit\n".as_bytes(),
        &mut out,
    )
    .await
    .unwrap();

    let out = String::from_utf8(out).unwrap();
    assert!(out.contains("[error]"), "{}", out);
    assert!(out.contains("not recorded"));
    assert!(out.contains("auth.py"), "the next command still ran");
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn loop_prints_each_reply_once_and_shuts_down_at_eof() {
    let backend = Arc::new(ScriptedBackend::default());
    let (_tmp, harness, mut session) = setup(backend).await;

    let mut out = Vec::new();
    run_loop(&mut session, "authentication logic?\n".as_bytes(), &mut out)
        .await
        .unwrap();

    let out = String::from_utf8(out).unwrap();
    assert_eq!(out.matches("agent: reply 1").count(), 1, "{}", out);
    assert_eq!(harness.log.read_all().unwrap().len(), 2);
    assert_eq!(session.phase(), Phase::Wake);
}
