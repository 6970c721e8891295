//! Engine binding for an OpenAI-compatible local inference server (llama.cpp server and
//! friends). Completions are streamed as server-sent events.

use crate::config::{CacheOptions, ChatConfig};
use crate::core::assistant::{
    ChatMessage, CompletionChunk, CompletionRequest, CompletionUsage, InitProgressReport,
    StreamOptions,
};
use crate::core::traits::{CompletionStream, InferenceEngine, ProgressCallback};
use anyhow::{Context, anyhow, bail};
use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

#[derive(Debug, Serialize)]
struct ChatCompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<&'a StreamOptions>,
    cache_prompt: bool,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ChunkBody {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

/// One parsed `data:` line of the completion event stream.
#[derive(Debug, PartialEq)]
enum SseLine {
    Chunk(CompletionChunk),
    Done,
    Ignored,
}

fn parse_sse_line(line: &str) -> anyhow::Result<SseLine> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseLine::Ignored);
    };
    let data = data.trim();

    if data.is_empty() {
        return Ok(SseLine::Ignored);
    }
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }

    let body: ChunkBody =
        serde_json::from_str(data).with_context(|| format!("malformed completion chunk: {data}"))?;

    Ok(SseLine::Chunk(CompletionChunk {
        delta: body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content),
        usage: body.usage,
    }))
}

/// Splits a completion event stream into increments.
///
/// Lines may arrive split across reads at any byte. Stops at `[DONE]`; a last line without a
/// trailing newline is still parsed when the body ends.
fn sse_chunks<S, B, E>(body: S) -> impl Stream<Item = anyhow::Result<CompletionChunk>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    try_stream! {
        let mut body = Box::pin(body);
        // bytes, so multi-byte characters split across reads survive
        let mut buffer: Vec<u8> = Vec::new();
        let mut finished = false;

        'read: while let Some(bytes) = body.next().await {
            let bytes = bytes.context("completion stream interrupted")?;
            buffer.extend_from_slice(bytes.as_ref());

            while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                let line = String::from_utf8_lossy(&line);

                match parse_sse_line(line.trim_end())? {
                    SseLine::Chunk(chunk) => yield chunk,
                    SseLine::Done => {
                        finished = true;
                        break 'read;
                    }
                    SseLine::Ignored => {}
                }
            }
        }

        if !finished && !buffer.is_empty() {
            let line = String::from_utf8_lossy(&buffer);
            if let SseLine::Chunk(chunk) = parse_sse_line(line.trim_end())? {
                yield chunk;
            }
        }
    }
}

pub struct HttpEngine {
    client: reqwest::Client,
    base_url: String,
    cache_options: CacheOptions,
    bound_model: Mutex<Option<String>>,
    progress_callback: Mutex<Option<ProgressCallback>>,
}

impl HttpEngine {
    pub fn new(config: &ChatConfig) -> Self {
        debug!(
            "HTTP engine at {} (prompt cache: {}, cache dir: {})",
            config.engine_url, config.cache_options.enable_cache, config.cache_options.cache_dir
        );

        Self {
            client: reqwest::Client::new(),
            base_url: config.engine_url.clone(),
            cache_options: config.cache_options.clone(),
            bound_model: Mutex::new(None),
            progress_callback: Mutex::new(None),
        }
    }

    fn report(&self, started: Instant, progress: f64, text: String) {
        let callback = self.progress_callback.lock().clone();
        if let Some(callback) = callback {
            callback(InitProgressReport {
                progress,
                time_elapsed: started.elapsed().as_secs_f64(),
                text,
            });
        }
    }

    async fn available_models(&self) -> anyhow::Result<Vec<String>> {
        let response = self
            .client
            .get(format!("{}/v1/models", self.base_url))
            .send()
            .await
            .with_context(|| format!("could not reach inference server at {}", self.base_url))?
            .error_for_status()?;

        let models: ModelList = response
            .json()
            .await
            .context("unexpected model list from inference server")?;

        Ok(models.data.into_iter().map(|m| m.id).collect())
    }
}

#[async_trait]
impl InferenceEngine for HttpEngine {
    fn set_init_progress_callback(&self, callback: ProgressCallback) {
        *self.progress_callback.lock() = Some(callback);
    }

    async fn reload(&self, model_id: &str) -> anyhow::Result<()> {
        let started = Instant::now();
        *self.bound_model.lock() = None;

        self.report(
            started,
            0.0,
            format!("Connecting to inference server at {}", self.base_url),
        );
        let models = self.available_models().await?;

        if !models.iter().any(|m| m == model_id) {
            bail!("model {model_id} is not served by {}", self.base_url);
        }

        *self.bound_model.lock() = Some(model_id.to_owned());
        self.report(started, 1.0, format!("Model {model_id} ready"));
        info!("Bound {model_id} on {}", self.base_url);
        Ok(())
    }

    async fn unload(&self) -> anyhow::Result<()> {
        if let Some(model_id) = self.bound_model.lock().take() {
            debug!("Released {model_id}");
        }
        Ok(())
    }

    async fn reset_chat(&self) -> anyhow::Result<()> {
        // the server keeps no conversation state beyond the prompt cache
        Ok(())
    }

    async fn chat_completion(
        &self,
        request: CompletionRequest,
    ) -> anyhow::Result<CompletionStream> {
        let model = self
            .bound_model
            .lock()
            .clone()
            .ok_or_else(|| anyhow!("no model loaded"))?;

        let body = ChatCompletionBody {
            model: &model,
            messages: &request.messages,
            stream: request.stream,
            stream_options: request.stream_options.as_ref(),
            cache_prompt: self.cache_options.enable_cache,
        };

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("could not reach inference server at {}", self.base_url))?
            .error_for_status()?;

        Ok(sse_chunks(response.bytes_stream()).boxed())
    }
}
