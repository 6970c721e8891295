//! Engine handle tests.
//!
//! Worker mode runs the scripted engine on the background thread, so everything observed here
//! crossed the request queue and the return channels.

mod common;

use common::ScriptedEngine;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_local_chat::config::ChatConfig;
use tokio_local_chat::core::assistant::{ChatMessage, CompletionRequest, InitProgressReport};
use tokio_local_chat::core::session::{ChatSession, ModelStatus, Outcome};
use tokio_local_chat::core::traits::ChatService;
use tokio_local_chat::infrastructure::engine::{EngineHandle, EngineMode};

fn config(use_worker: bool) -> ChatConfig {
    ChatConfig {
        use_worker,
        ..ChatConfig::default()
    }
}

fn worker_handle(engine: &Arc<ScriptedEngine>) -> EngineHandle {
    EngineHandle::create_with_backend(&config(true), engine.clone())
}

fn request(text: &str) -> CompletionRequest {
    CompletionRequest::streaming(&[ChatMessage::user(text)])
}

#[tokio::test]
async fn test_direct_mode_uses_backend() {
    let engine = ScriptedEngine::new();
    let handle = EngineHandle::create_with_backend(&config(false), engine.clone());

    assert_eq!(handle.mode(), EngineMode::Direct);
    handle.reload("A").await.unwrap();
    assert_eq!(engine.calls(), vec!["reload:A"]);
}

#[tokio::test]
async fn test_worker_mode_forwards_lifecycle_calls() {
    let engine = ScriptedEngine::new();
    let handle = worker_handle(&engine);
    assert_eq!(handle.mode(), EngineMode::Worker);

    handle.reload("A").await.unwrap();
    handle.reset_chat().await.unwrap();
    handle.unload().await.unwrap();

    assert_eq!(engine.calls(), vec!["reload:A", "reset", "unload"]);
}

#[tokio::test]
async fn test_worker_forwards_progress_before_reload_returns() {
    let engine = ScriptedEngine::new();
    engine.report_progress(&["Fetching[1/2]", "Loading[2/2]"]);
    let handle = worker_handle(&engine);

    let seen = Arc::new(Mutex::new(Vec::new()));
    handle.set_init_progress_callback(Arc::new({
        let seen = seen.clone();
        move |report: InitProgressReport| seen.lock().push(report.text)
    }));

    handle.reload("A").await.unwrap();

    assert_eq!(*seen.lock(), vec!["Fetching[1/2]", "Loading[2/2]"]);
}

#[tokio::test]
async fn test_worker_reports_reload_failure() {
    let engine = ScriptedEngine::new();
    engine.fail_reload("A", "no such model");
    let handle = worker_handle(&engine);

    let err = handle.reload("A").await.unwrap_err();

    assert_eq!(err.to_string(), "no such model");
}

#[tokio::test]
async fn test_worker_streams_increments_in_order() {
    let engine = ScriptedEngine::new();
    engine.push_reply(&["one ", "two ", "three"]);
    let handle = worker_handle(&engine);

    let chunks: Vec<_> = handle
        .chat_completion(request("count"))
        .await
        .unwrap()
        .collect()
        .await;

    let text: Vec<String> = chunks
        .iter()
        .filter_map(|chunk| chunk.as_ref().unwrap().delta.clone())
        .collect();
    assert_eq!(text, vec!["one ", "two ", "three"]);
    assert!(chunks.last().unwrap().as_ref().unwrap().usage.is_some());
    assert_eq!(engine.requests()[0], request("count"));
}

#[tokio::test]
async fn test_worker_propagates_stream_errors() {
    let engine = ScriptedEngine::new();
    engine.push_failing_reply(&["partial"], "device lost");
    engine.push_rejection("busy");
    let handle = worker_handle(&engine);

    let chunks: Vec<_> = handle
        .chat_completion(request("a"))
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(chunks.len(), 2);
    assert_eq!(
        chunks[1].as_ref().unwrap_err().to_string(),
        "device lost"
    );

    // a rejected request surfaces as the first item of the stream
    let mut rejected = handle.chat_completion(request("b")).await.unwrap();
    let first = rejected.next().await.unwrap();
    assert_eq!(first.unwrap_err().to_string(), "busy");
    assert!(rejected.next().await.is_none());
}

#[tokio::test]
async fn test_session_runs_over_worker() {
    let engine = ScriptedEngine::new();
    engine.report_progress(&["Loading[1/1]"]);
    engine.push_reply(&["Hi", "!"]);
    let handle = worker_handle(&engine);
    let session = ChatSession::new(handle.engine());

    assert_eq!(session.select_model("A").await.unwrap(), Outcome::Applied);
    assert_eq!(session.submit("hello").await.unwrap(), Outcome::Applied);

    let snapshot = session.snapshot();
    assert_eq!(snapshot.status, ModelStatus::Ready);
    assert_eq!(
        snapshot.messages,
        vec![ChatMessage::user("hello"), ChatMessage::assistant("Hi!")]
    );
    assert!(snapshot.last_usage.is_some());
}

#[tokio::test]
async fn test_unload_waits_for_running_completion() {
    let engine = ScriptedEngine::new();
    let feed = engine.push_stalled_reply();
    let handle = worker_handle(&engine);

    let _stream = handle.chat_completion(request("a")).await.unwrap();
    let worker = handle.engine();
    let unload = tokio::spawn(async move { worker.unload().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!unload.is_finished());
    assert_eq!(engine.calls(), vec!["completion"]);

    drop(feed);
    unload.await.unwrap().unwrap();
    assert_eq!(engine.calls(), vec!["completion", "unload"]);
}
