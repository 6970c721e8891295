//! LLM Assistant service.
//!

use crate::core::traits::InferenceEngine;
use futures_util::StreamExt;
use log::debug;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOptions {
    pub include_usage: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    pub stream_options: Option<StreamOptions>,
}

impl CompletionRequest {
    /// Token-level streaming request over the whole history, with a trailing usage record.
    pub fn streaming(history: &[ChatMessage]) -> Self {
        Self {
            messages: history.to_vec(),
            stream: true,
            stream_options: Some(StreamOptions {
                include_usage: true,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// One increment of a streamed completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionChunk {
    pub delta: Option<String>,
    pub usage: Option<CompletionUsage>,
}

impl CompletionChunk {
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            delta: Some(delta.into()),
            usage: None,
        }
    }

    pub fn usage(usage: CompletionUsage) -> Self {
        Self {
            delta: None,
            usage: Some(usage),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InitProgressReport {
    pub progress: f64,
    pub time_elapsed: f64,
    pub text: String,
}

impl InitProgressReport {
    pub fn new(progress: f64, text: impl Into<String>) -> Self {
        Self {
            progress,
            time_elapsed: 0.0,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamedReply {
    pub text: String,
    pub usage: Option<CompletionUsage>,
    pub increments: usize,
}

/// Requests a streaming completion for `history` and calls `on_update` with the cumulative
/// reply after every non-empty increment.
///
/// The accumulator lives only for this call. Increments are applied in arrival order, so
/// every value passed to `on_update` is a prefix of the next one.
pub async fn stream_reply<F>(
    engine: &dyn InferenceEngine,
    history: &[ChatMessage],
    mut on_update: F,
) -> anyhow::Result<StreamedReply>
where
    F: FnMut(&str),
{
    let mut stream = engine
        .chat_completion(CompletionRequest::streaming(history))
        .await?;

    let mut reply = StreamedReply::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;

        if let Some(usage) = chunk.usage {
            reply.usage = Some(usage);
        }

        match chunk.delta {
            Some(delta) if !delta.is_empty() => {
                reply.text.push_str(&delta);
                reply.increments += 1;
                on_update(&reply.text);
            }
            _ => {}
        }
    }

    debug!(
        "Completion finished after {} increments ({} chars)",
        reply.increments,
        reply.text.len()
    );

    Ok(reply)
}
