//! Scripted engine shared by the integration tests.

#![allow(dead_code)]

use anyhow::anyhow;
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio_local_chat::core::assistant::{
    CompletionChunk, CompletionRequest, CompletionUsage, InitProgressReport,
};
use tokio_local_chat::core::traits::{CompletionStream, InferenceEngine, ProgressCallback};

enum Reply {
    Chunks(Vec<anyhow::Result<CompletionChunk>>),
    Stalled(mpsc::UnboundedReceiver<anyhow::Result<CompletionChunk>>),
    Rejected(String),
}

/// Engine whose behaviour is scripted up front. Every call is recorded in order.
#[derive(Default)]
pub struct ScriptedEngine {
    calls: Mutex<Vec<String>>,
    requests: Mutex<Vec<CompletionRequest>>,
    failing_models: Mutex<HashMap<String, String>>,
    progress_script: Mutex<Vec<String>>,
    progress_callback: Mutex<Option<ProgressCallback>>,
    replies: Mutex<VecDeque<Reply>>,
    reload_gate: Mutex<Option<Arc<Semaphore>>>,
    reset_gate: Mutex<Option<Arc<Semaphore>>>,
    reset_failure: Mutex<Option<String>>,
}

impl ScriptedEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_reload(&self, model_id: &str, message: &str) {
        self.failing_models
            .lock()
            .insert(model_id.to_owned(), message.to_owned());
    }

    pub fn fail_reset(&self, message: &str) {
        *self.reset_failure.lock() = Some(message.to_owned());
    }

    /// Progress texts reported during every reload.
    pub fn report_progress(&self, texts: &[&str]) {
        *self.progress_script.lock() = texts.iter().map(|t| t.to_string()).collect();
    }

    /// Queues a completion streaming `deltas` followed by a usage record.
    pub fn push_reply(&self, deltas: &[&str]) {
        let mut chunks: Vec<anyhow::Result<CompletionChunk>> = deltas
            .iter()
            .map(|d| Ok(CompletionChunk::text(*d)))
            .collect();
        chunks.push(Ok(CompletionChunk::usage(CompletionUsage {
            prompt_tokens: 10,
            completion_tokens: deltas.len() as u32,
            total_tokens: 10 + deltas.len() as u32,
        })));
        self.replies.lock().push_back(Reply::Chunks(chunks));
    }

    /// Queues a completion streaming `deltas` and then failing with `message`.
    pub fn push_failing_reply(&self, deltas: &[&str], message: &str) {
        let mut chunks: Vec<anyhow::Result<CompletionChunk>> = deltas
            .iter()
            .map(|d| Ok(CompletionChunk::text(*d)))
            .collect();
        chunks.push(Err(anyhow!(message.to_owned())));
        self.replies.lock().push_back(Reply::Chunks(chunks));
    }

    /// Queues a completion that the engine refuses to start.
    pub fn push_rejection(&self, message: &str) {
        self.replies
            .lock()
            .push_back(Reply::Rejected(message.to_owned()));
    }

    /// Queues a completion fed by the returned sender. The stream ends when the sender drops.
    pub fn push_stalled_reply(&self) -> mpsc::UnboundedSender<anyhow::Result<CompletionChunk>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.replies
            .lock()
            .push_back(Reply::Stalled(receiver));
        sender
    }

    /// Makes every reload wait for a permit on the returned semaphore.
    pub fn gate_reloads(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.reload_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    /// Makes every conversation reset wait for a permit on the returned semaphore.
    pub fn gate_resets(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.reset_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn reload_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with("reload:"))
            .count()
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }
}

#[async_trait]
impl InferenceEngine for ScriptedEngine {
    fn set_init_progress_callback(&self, callback: ProgressCallback) {
        *self.progress_callback.lock() = Some(callback);
    }

    async fn reload(&self, model_id: &str) -> anyhow::Result<()> {
        self.record(format!("reload:{model_id}"));

        let gate = self.reload_gate.lock().clone();
        if let Some(gate) = gate {
            gate.acquire().await?.forget();
        }

        let callback = self.progress_callback.lock().clone();
        let script = self.progress_script.lock().clone();
        if let Some(callback) = callback {
            let steps = script.len().max(1) as f64;
            for (i, text) in script.into_iter().enumerate() {
                callback(InitProgressReport::new((i + 1) as f64 / steps, text));
            }
        }

        let failure = self.failing_models.lock().get(model_id).cloned();
        match failure {
            Some(message) => Err(anyhow!(message)),
            None => Ok(()),
        }
    }

    async fn unload(&self) -> anyhow::Result<()> {
        self.record("unload");
        Ok(())
    }

    async fn reset_chat(&self) -> anyhow::Result<()> {
        self.record("reset");

        let gate = self.reset_gate.lock().clone();
        if let Some(gate) = gate {
            gate.acquire().await?.forget();
        }

        let failure = self.reset_failure.lock().clone();
        match failure {
            Some(message) => Err(anyhow!(message)),
            None => Ok(()),
        }
    }

    async fn chat_completion(
        &self,
        request: CompletionRequest,
    ) -> anyhow::Result<CompletionStream> {
        self.record("completion");
        self.requests.lock().push(request);

        let reply = self.replies.lock().pop_front();
        match reply {
            Some(Reply::Chunks(chunks)) => Ok(stream::iter(chunks).boxed()),
            Some(Reply::Stalled(receiver)) => Ok(stream::unfold(receiver, |mut receiver| async move {
                receiver.recv().await.map(|chunk| (chunk, receiver))
            })
            .boxed()),
            Some(Reply::Rejected(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no scripted reply")),
        }
    }
}

/// Polls `condition` until it holds, failing the test after a second.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
