//! DI "Interfaces"

use crate::core::assistant::{CompletionChunk, CompletionRequest, InitProgressReport};
use crate::core::errors::SessionError;
use crate::core::session::{Outcome, SessionSnapshot};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Receives free-text load progress pushed by the engine.
pub type ProgressCallback = Arc<dyn Fn(InitProgressReport) + Send + Sync>;

/// Lazy sequence of increments for one completion, ending when the model stops generating.
pub type CompletionStream = BoxStream<'static, anyhow::Result<CompletionChunk>>;

/// Opaque capability of the external inference engine.
///
/// The engine is bound to at most one model at a time. `reload` swaps the bound model and
/// `unload` releases it; calling `unload` with nothing bound is not an error.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Registers the callback that receives progress reports during `reload`.
    fn set_init_progress_callback(&self, callback: ProgressCallback);

    async fn reload(&self, model_id: &str) -> anyhow::Result<()>;

    async fn unload(&self) -> anyhow::Result<()>;

    /// Clears the engine-side chat context of the bound model.
    async fn reset_chat(&self) -> anyhow::Result<()>;

    async fn chat_completion(&self, request: CompletionRequest)
    -> anyhow::Result<CompletionStream>;
}

/// The session controller as seen by the presentation layer.
#[async_trait]
pub trait ChatService: Send + Sync {
    /// Current session state including the conversation history.
    fn snapshot(&self) -> SessionSnapshot;

    /// Receives every state published after a transition.
    fn subscribe(&self) -> broadcast::Receiver<SessionSnapshot>;

    /// Selects the model to chat with, loading it if needed.
    ///
    /// Returns `Err` if the engine failed to load the model. The error is also recorded as
    /// the session's last error.
    async fn select_model(&self, model_id: &str) -> Result<Outcome, SessionError>;

    /// Appends a user message and streams the assistant's reply into the history.
    ///
    /// Returns `Err` if generation failed. Whatever was received before the failure stays in
    /// the history.
    async fn submit(&self, text: &str) -> Result<Outcome, SessionError>;

    /// Clears the conversation on both sides.
    async fn reset(&self) -> Result<Outcome, SessionError>;

    /// Ends the session and releases the bound model.
    async fn teardown(&self);
}
