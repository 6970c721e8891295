//! Worker mode.
//!
//! The backend engine lives on its own OS thread with a private tokio runtime. The handle side
//! only holds the sending half of the request queue; every reply, progress report and increment
//! comes back over a channel. Requests are served strictly in arrival order.

use crate::core::assistant::{CompletionChunk, CompletionRequest, InitProgressReport};
use crate::core::traits::{CompletionStream, InferenceEngine, ProgressCallback};
use anyhow::anyhow;
use async_stream::stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, error, info};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::runtime::Builder;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

const WORKER_QUEUE_SIZE: usize = 10;
const RETURN_CHANNEL_SIZE: usize = 1000;

type Reply = oneshot::Sender<anyhow::Result<()>>;

pub struct InferenceTask {
    request: CompletionRequest,
    return_channel: mpsc::Sender<anyhow::Result<CompletionChunk>>,
}

impl InferenceTask {
    pub fn new(
        request: CompletionRequest,
    ) -> (InferenceTask, mpsc::Receiver<anyhow::Result<CompletionChunk>>) {
        let (sender, receiver) = mpsc::channel(RETURN_CHANNEL_SIZE);

        (
            InferenceTask {
                request,
                return_channel: sender,
            },
            receiver,
        )
    }
}

pub enum EngineRequest {
    Reload {
        model_id: String,
        progress: mpsc::UnboundedSender<InitProgressReport>,
        reply: Reply,
    },
    Unload {
        reply: Reply,
    },
    ResetChat {
        reply: Reply,
    },
    Completion(InferenceTask),
}

/// Serves engine requests until every handle to the queue is dropped.
pub async fn background_task(
    engine: Arc<dyn InferenceEngine>,
    mut task_queue: mpsc::Receiver<EngineRequest>,
) {
    loop {
        match task_queue.recv().await {
            None => {
                debug!("Inference worker queue closed");
                return;
            }
            Some(EngineRequest::Reload {
                model_id,
                progress,
                reply,
            }) => {
                engine.set_init_progress_callback(Arc::new(move |report| {
                    let _ = progress.send(report);
                }));

                let load_start = Instant::now();
                let result = engine.reload(&model_id).await;
                info!(
                    "Worker reload of {model_id} finished in {:.2} seconds (ok: {})",
                    load_start.elapsed().as_secs_f32(),
                    result.is_ok()
                );
                let _ = reply.send(result);
            }
            Some(EngineRequest::Unload { reply }) => {
                let _ = reply.send(engine.unload().await);
            }
            Some(EngineRequest::ResetChat { reply }) => {
                let _ = reply.send(engine.reset_chat().await);
            }
            Some(EngineRequest::Completion(task)) => {
                run_completion(engine.as_ref(), task).await;
            }
        }
    }
}

async fn run_completion(engine: &dyn InferenceEngine, task: InferenceTask) {
    let inference_start = Instant::now();

    let mut stream = match engine.chat_completion(task.request).await {
        Ok(stream) => stream,
        Err(err) => {
            let _ = task.return_channel.send(Err(err)).await;
            return;
        }
    };

    let mut total_forwarded = 0;
    while let Some(chunk) = stream.next().await {
        let failed = chunk.is_err();

        match task.return_channel.send(chunk).await {
            Ok(_) => {}
            Err(_) => {
                debug!("Completion receiver dropped, stopping");
                break;
            }
        }

        if failed {
            break;
        }
        total_forwarded += 1;
    }

    info!(
        "Inference done, total time: {:?} for {total_forwarded} increments.",
        inference_start.elapsed()
    );
}

/// Engine handle that forwards every call to a dedicated background worker.
///
/// The worker serves one request at a time and a completion occupies it until its stream ends.
/// An `unload` issued meanwhile, and with it a session teardown, waits for that completion.
pub struct WorkerEngine {
    task_sender: mpsc::Sender<EngineRequest>,
    progress_callback: Mutex<Option<ProgressCallback>>,
}

impl WorkerEngine {
    /// Starts the worker thread for `engine`.
    ///
    /// A worker that fails to start is only logged here; requests made afterwards fail.
    pub fn spawn(engine: Arc<dyn InferenceEngine>) -> WorkerEngine {
        let (task_sender, task_receiver) = mpsc::channel(WORKER_QUEUE_SIZE);

        let spawned = std::thread::Builder::new()
            .name("inference-worker".to_owned())
            .spawn(move || match Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime.block_on(background_task(engine, task_receiver)),
                Err(err) => error!("Failed to start inference worker runtime: {err}"),
            });

        if let Err(err) = spawned {
            error!("Failed to spawn inference worker: {err}");
        }

        WorkerEngine {
            task_sender,
            progress_callback: Mutex::new(None),
        }
    }

    async fn send(&self, request: EngineRequest) -> anyhow::Result<()> {
        self.task_sender
            .send(request)
            .await
            .map_err(|_| anyhow!("inference worker is not running"))
    }

    async fn call(&self, request: impl FnOnce(Reply) -> EngineRequest) -> anyhow::Result<()> {
        let (reply, response) = oneshot::channel();
        self.send(request(reply)).await?;
        response
            .await
            .map_err(|_| anyhow!("inference worker dropped the request"))?
    }
}

#[async_trait]
impl InferenceEngine for WorkerEngine {
    fn set_init_progress_callback(&self, callback: ProgressCallback) {
        *self.progress_callback.lock() = Some(callback);
    }

    async fn reload(&self, model_id: &str) -> anyhow::Result<()> {
        let (progress, mut reports) = mpsc::unbounded_channel();
        let (reply, mut response) = oneshot::channel();

        self.send(EngineRequest::Reload {
            model_id: model_id.to_owned(),
            progress,
            reply,
        })
        .await?;

        let callback = self.progress_callback.lock().clone();
        let notify = |report: InitProgressReport| {
            if let Some(callback) = &callback {
                callback(report);
            }
        };

        let result = loop {
            tokio::select! {
                biased;
                Some(report) = reports.recv() => notify(report),
                result = &mut response => break result,
            }
        };
        // reports sent just before the reply
        while let Ok(report) = reports.try_recv() {
            notify(report);
        }

        result.map_err(|_| anyhow!("inference worker dropped the request"))?
    }

    async fn unload(&self) -> anyhow::Result<()> {
        self.call(|reply| EngineRequest::Unload { reply }).await
    }

    async fn reset_chat(&self) -> anyhow::Result<()> {
        self.call(|reply| EngineRequest::ResetChat { reply }).await
    }

    async fn chat_completion(
        &self,
        request: CompletionRequest,
    ) -> anyhow::Result<CompletionStream> {
        let (task, mut receiver) = InferenceTask::new(request);
        self.send(EngineRequest::Completion(task)).await?;

        let stream = stream! {
            while let Some(chunk) = receiver.recv().await {
                yield chunk;
            }
        };

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::assistant::ChatMessage;

    #[tokio::test]
    async fn test_inference_task_new_creates_channel() {
        let request = CompletionRequest::streaming(&[ChatMessage::user("Hello")]);

        let (task, mut receiver) = InferenceTask::new(request);

        task.return_channel
            .send(Ok(CompletionChunk::text("test")))
            .await
            .unwrap();

        let received = receiver.recv().await.unwrap().unwrap();
        assert_eq!(received, CompletionChunk::text("test"));
    }

    #[tokio::test]
    async fn test_requests_fail_when_worker_is_gone() {
        let (task_sender, task_receiver) = mpsc::channel(1);
        drop(task_receiver);

        let engine = WorkerEngine {
            task_sender,
            progress_callback: Mutex::new(None),
        };

        let err = engine.reload("a").await.unwrap_err();
        assert_eq!(err.to_string(), "inference worker is not running");
        assert!(engine.unload().await.is_err());
    }
}
