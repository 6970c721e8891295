//! Session controller.
//!
//! Owns the conversation history and the model selection, and sequences every call into the
//! engine. State changes happen under a short synchronous lock and are re-published to
//! subscribers as immutable snapshots. Engine lifecycle calls (reload, unload, reset) run one at
//! a time on an async lane.
//!
//! Loads and streams are tagged when issued: a load with its load generation, a stream with the
//! session epoch. A result whose tag is no longer current is dropped instead of overwriting newer
//! state.

use crate::core::assistant::{self, ChatMessage, CompletionUsage, InitProgressReport};
use crate::core::errors::SessionError;
use crate::core::traits::{ChatService, InferenceEngine};
use crate::infrastructure::engine::EngineHandle;
use async_trait::async_trait;
use di::{Ref, inject, injectable};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

const UPDATE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Idle,
    ModelLoading,
    Ready,
    Error,
}

/// Why an intent was ignored. Skips mirror a disabled control and are not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    EmptyMessage,
    NoModelSelected,
    AlreadySelected,
    ModelNotReady,
    SubmissionInFlight,
    ResetInFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    Applied,
    Skipped(SkipReason),
    /// A newer selection or a teardown took over before this operation finished.
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub selected_model_id: Option<String>,
    pub status: ModelStatus,
    pub is_submitting: bool,
    pub is_model_loading: bool,
    pub loading_progress_text: String,
    pub last_error: Option<String>,
    pub loaded_model_ids: Vec<String>,
    pub messages: Vec<ChatMessage>,
    pub last_usage: Option<CompletionUsage>,
}

struct SessionState {
    session_id: Uuid,
    selected_model_id: Option<String>,
    status: ModelStatus,
    is_submitting: bool,
    is_resetting: bool,
    loading_progress_text: String,
    last_error: Option<String>,
    // only grows
    loaded_model_ids: BTreeSet<String>,
    bound_model_id: Option<String>,
    messages: Vec<ChatMessage>,
    last_usage: Option<CompletionUsage>,
    load_generation: u64,
    epoch: u64,
}

impl SessionState {
    fn new() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            selected_model_id: None,
            status: ModelStatus::Idle,
            is_submitting: false,
            is_resetting: false,
            loading_progress_text: String::new(),
            last_error: None,
            loaded_model_ids: BTreeSet::new(),
            bound_model_id: None,
            messages: Vec::new(),
            last_usage: None,
            load_generation: 0,
            epoch: 0,
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id,
            selected_model_id: self.selected_model_id.clone(),
            status: self.status,
            is_submitting: self.is_submitting,
            is_model_loading: self.status == ModelStatus::ModelLoading,
            loading_progress_text: self.loading_progress_text.clone(),
            last_error: self.last_error.clone(),
            loaded_model_ids: self.loaded_model_ids.iter().cloned().collect(),
            messages: self.messages.clone(),
            last_usage: self.last_usage,
        }
    }

    fn submit_blocker(&self) -> Option<SkipReason> {
        if self.selected_model_id.is_none() {
            Some(SkipReason::NoModelSelected)
        } else if self.is_submitting {
            Some(SkipReason::SubmissionInFlight)
        } else if self.is_resetting {
            Some(SkipReason::ResetInFlight)
        } else if self.status != ModelStatus::Ready {
            Some(SkipReason::ModelNotReady)
        } else {
            None
        }
    }

    fn reset_blocker(&self) -> Option<SkipReason> {
        if self.is_submitting {
            Some(SkipReason::SubmissionInFlight)
        } else if self.is_resetting {
            Some(SkipReason::ResetInFlight)
        } else if self.status != ModelStatus::Ready {
            Some(SkipReason::ModelNotReady)
        } else {
            None
        }
    }
}

struct Shared {
    state: Mutex<SessionState>,
    updates: broadcast::Sender<SessionSnapshot>,
}

impl Shared {
    /// Must be called with the state lock held so subscribers see updates in order.
    fn publish(&self, state: &SessionState) {
        // no subscribers is fine
        let _ = self.updates.send(state.snapshot());
    }

    fn is_current_load(&self, generation: u64) -> bool {
        self.state.lock().load_generation == generation
    }

    fn apply_progress(&self, generation: u64, text: String) {
        let mut state = self.state.lock();
        if state.load_generation != generation || state.status != ModelStatus::ModelLoading {
            return;
        }
        debug!("Load progress: {text}");
        state.loading_progress_text = text;
        self.publish(&state);
    }

    /// Replaces the in-progress assistant message with the cumulative reply.
    fn apply_reply(&self, epoch: u64, prior: &[ChatMessage], reply: &str) {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            return;
        }

        let mut messages = Vec::with_capacity(prior.len() + 1);
        messages.extend_from_slice(prior);
        messages.push(ChatMessage::assistant(reply));
        state.messages = messages;
        self.publish(&state);
    }
}

enum Flag {
    Submitting,
    Resetting,
}

/// Clears an in-flight flag when the owning operation ends, however it ends.
struct FlagGuard<'a> {
    shared: &'a Shared,
    flag: Flag,
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        match self.flag {
            Flag::Submitting => {
                state.is_submitting = false;
                self.shared.publish(&state);
            }
            Flag::Resetting => state.is_resetting = false,
        }
    }
}

/// One chat session bound to a single engine handle.
pub struct ChatSession {
    engine: Arc<dyn InferenceEngine>,
    shared: Arc<Shared>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl ChatSession {
    pub fn new(engine: Arc<dyn InferenceEngine>) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);

        Self {
            engine,
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState::new()),
                updates,
            }),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Unloads whatever the engine currently holds. Unload failures are logged and ignored.
    async fn release_model(&self) {
        if let Err(err) = self.engine.unload().await {
            warn!("Failed to unload model: {err:#}");
        }
        self.shared.state.lock().bound_model_id = None;
    }

    async fn load_model(&self, model_id: &str, generation: u64) -> Result<Outcome, SessionError> {
        let shared = Arc::clone(&self.shared);
        self.engine
            .set_init_progress_callback(Arc::new(move |report: InitProgressReport| {
                shared.apply_progress(generation, report.text);
            }));

        if let Err(err) = self.engine.reload(model_id).await {
            let error = SessionError::model_load(&err);
            let mut state = self.shared.state.lock();
            state.bound_model_id = None;

            if state.load_generation != generation {
                warn!("Discarding failure of superseded load #{generation}: {err:#}");
                return Ok(Outcome::Superseded);
            }

            error!("{error}");
            state.status = ModelStatus::Error;
            state.last_error = Some(error.to_string());
            self.shared.publish(&state);
            return Err(error);
        }

        let mut state = self.shared.state.lock();
        state.bound_model_id = Some(model_id.to_owned());
        state.loaded_model_ids.insert(model_id.to_owned());

        if state.load_generation != generation {
            debug!("Load #{generation} of {model_id} finished after being superseded");
            self.shared.publish(&state);
            return Ok(Outcome::Superseded);
        }

        state.status = ModelStatus::Ready;
        self.shared.publish(&state);
        info!("Model {model_id} ready");
        Ok(Outcome::Applied)
    }
}

#[injectable(ChatService)]
impl ChatSession {
    #[inject]
    pub fn create(engine: Ref<EngineHandle>) -> ChatSession {
        ChatSession::new(engine.engine())
    }
}

#[async_trait]
impl ChatService for ChatSession {
    fn snapshot(&self) -> SessionSnapshot {
        self.shared.state.lock().snapshot()
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionSnapshot> {
        self.shared.updates.subscribe()
    }

    async fn select_model(&self, model_id: &str) -> Result<Outcome, SessionError> {
        let model_id = model_id.trim();
        if model_id.is_empty() {
            return Ok(Outcome::Skipped(SkipReason::NoModelSelected));
        }

        let generation = {
            let mut state = self.shared.state.lock();
            if state.is_submitting {
                return Ok(Outcome::Skipped(SkipReason::SubmissionInFlight));
            }
            if state.is_resetting {
                return Ok(Outcome::Skipped(SkipReason::ResetInFlight));
            }
            // reselecting after a failed load retries it
            if state.selected_model_id.as_deref() == Some(model_id)
                && state.status != ModelStatus::Error
            {
                return Ok(Outcome::Skipped(SkipReason::AlreadySelected));
            }

            state.selected_model_id = Some(model_id.to_owned());
            state.status = ModelStatus::ModelLoading;
            state.last_error = None;
            state.loading_progress_text.clear();
            state.load_generation += 1;
            self.shared.publish(&state);
            state.load_generation
        };
        info!("Selecting model {model_id} (load #{generation})");

        let _lane = self.lifecycle.lock().await;
        if !self.shared.is_current_load(generation) {
            debug!("Load #{generation} of {model_id} superseded before it started");
            return Ok(Outcome::Superseded);
        }

        let (bound_model_id, already_loaded) = {
            let state = self.shared.state.lock();
            let bound = state.bound_model_id.clone();
            let loaded = state.loaded_model_ids.contains(model_id)
                && bound.as_deref() == Some(model_id);
            (bound, loaded)
        };

        if already_loaded {
            let mut state = self.shared.state.lock();
            state.status = ModelStatus::Ready;
            self.shared.publish(&state);
            info!("Model {model_id} already loaded");
            return Ok(Outcome::Applied);
        }

        if let Some(bound_model_id) = bound_model_id {
            debug!("Releasing {bound_model_id} before loading {model_id}");
            self.release_model().await;
        }

        self.load_model(model_id, generation).await
    }

    async fn submit(&self, text: &str) -> Result<Outcome, SessionError> {
        if text.trim().is_empty() {
            return Ok(Outcome::Skipped(SkipReason::EmptyMessage));
        }

        let (history, epoch) = {
            let mut state = self.shared.state.lock();
            if let Some(reason) = state.submit_blocker() {
                return Ok(Outcome::Skipped(reason));
            }

            state.messages.push(ChatMessage::user(text));
            state.is_submitting = true;
            self.shared.publish(&state);
            (state.messages.clone(), state.epoch)
        };
        let _submitting = FlagGuard {
            shared: &self.shared,
            flag: Flag::Submitting,
        };

        let shared = &self.shared;
        let result = assistant::stream_reply(self.engine.as_ref(), &history, |reply| {
            shared.apply_reply(epoch, &history, reply)
        })
        .await;

        match result {
            Ok(reply) => {
                // an empty reply still takes its turn in the history
                if reply.increments == 0 {
                    self.shared.apply_reply(epoch, &history, "");
                }

                let mut state = self.shared.state.lock();
                if state.epoch == epoch {
                    state.last_usage = reply.usage;
                    self.shared.publish(&state);
                }
                Ok(Outcome::Applied)
            }
            Err(err) => {
                let error = SessionError::generation(&err);
                let mut state = self.shared.state.lock();
                if state.epoch != epoch {
                    warn!("Discarding failure of a stream from an ended session: {err:#}");
                    return Ok(Outcome::Superseded);
                }

                error!("{error}");
                state.last_error = Some(error.to_string());
                self.shared.publish(&state);
                Err(error)
            }
        }
    }

    async fn reset(&self) -> Result<Outcome, SessionError> {
        {
            let mut state = self.shared.state.lock();
            if let Some(reason) = state.reset_blocker() {
                return Ok(Outcome::Skipped(reason));
            }
            state.is_resetting = true;
        }
        let _resetting = FlagGuard {
            shared: &self.shared,
            flag: Flag::Resetting,
        };

        let _lane = self.lifecycle.lock().await;
        let ready = self.shared.state.lock().status == ModelStatus::Ready;
        if !ready {
            return Ok(Outcome::Skipped(SkipReason::ModelNotReady));
        }

        match self.engine.reset_chat().await {
            Ok(()) => {
                let mut state = self.shared.state.lock();
                state.messages.clear();
                state.last_error = None;
                state.last_usage = None;
                self.shared.publish(&state);
                info!("Conversation reset");
                Ok(Outcome::Applied)
            }
            Err(err) => {
                let error = SessionError::reset(&err);
                error!("{error}");
                let mut state = self.shared.state.lock();
                state.last_error = Some(error.to_string());
                self.shared.publish(&state);
                Err(error)
            }
        }
    }

    async fn teardown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.load_generation += 1;
            state.epoch += 1;
        }

        let _lane = self.lifecycle.lock().await;
        self.release_model().await;

        let mut state = self.shared.state.lock();
        state.selected_model_id = None;
        state.status = ModelStatus::Idle;
        state.loading_progress_text.clear();
        self.shared.publish(&state);
        info!("Session {} torn down", state.session_id);
    }
}
