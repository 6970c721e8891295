//! Session endpoints

use crate::api::session::schemas::{IntentResponse, SelectModel, SubmitMessage, SubmitResult};
use crate::config::ChatConfig;
use crate::core::errors::SessionError;
use crate::core::session::{Outcome, SessionSnapshot};
use crate::core::traits::ChatService;
use async_stream::stream;
use axum::http::StatusCode;
use axum::response::Sse;
use axum::response::sse::{Event, KeepAlive};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use di::Ref;
use di_axum::Inject;
use futures_util::Stream;
use log::{error, warn};
use std::convert::Infallible;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinError;

pub fn router() -> Router {
    Router::new()
        .route("/", get(session_state))
        .route("/events", get(session_events))
        .route("/model", put(select_model))
        .route("/messages", post(submit_message))
        .route("/reset", post(reset_conversation))
}

async fn session_state(
    Inject(session): Inject<dyn ChatService>,
) -> (StatusCode, Json<SessionSnapshot>) {
    (StatusCode::OK, Json(session.snapshot()))
}

async fn session_events(
    Inject(session): Inject<dyn ChatService>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut updates = session.subscribe();
    let current = session.snapshot();

    let stream = stream! {
        yield Ok(state_event(&current));

        loop {
            match updates.recv().await {
                Ok(snapshot) => yield Ok(state_event(&snapshot)),
                Err(RecvError::Lagged(skipped)) => warn!("Event subscriber lagged by {skipped} updates"),
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn select_model(
    Inject(session): Inject<dyn ChatService>,
    Inject(config): Inject<ChatConfig>,
    Json(select): Json<SelectModel>,
) -> (StatusCode, Json<IntentResponse>) {
    let model_id = select.model_id.trim().to_owned();
    if !config.has_model(&model_id) {
        return (
            StatusCode::NOT_FOUND,
            Json(IntentResponse {
                outcome: None,
                error: Some(format!("unknown model {model_id}")),
                session: session.snapshot(),
            }),
        );
    }

    let worker = session.clone();
    let result = tokio::spawn(async move { worker.select_model(&model_id).await }).await;

    intent_response(&session, result)
}

async fn reset_conversation(
    Inject(session): Inject<dyn ChatService>,
) -> (StatusCode, Json<IntentResponse>) {
    let worker = session.clone();
    let result = tokio::spawn(async move { worker.reset().await }).await;

    intent_response(&session, result)
}

async fn submit_message(
    Inject(session): Inject<dyn ChatService>,
    Json(message): Json<SubmitMessage>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut updates = session.subscribe();
    let worker = session.clone();
    let mut submission = tokio::spawn(async move { worker.submit(&message.text).await });

    let stream = stream! {
        let mut updates_open = true;

        loop {
            let step = tokio::select! {
                biased;
                update = updates.recv(), if updates_open => Step::Update(update),
                finished = &mut submission => Step::Finished(finished),
            };

            match step {
                Step::Update(Ok(snapshot)) => yield Ok(state_event(&snapshot)),
                Step::Update(Err(RecvError::Lagged(skipped))) => {
                    warn!("Submission stream lagged by {skipped} updates")
                }
                Step::Update(Err(RecvError::Closed)) => updates_open = false,
                Step::Finished(finished) => {
                    yield Ok(json_event("done", &submit_result(finished)));
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

enum Step {
    Update(Result<SessionSnapshot, RecvError>),
    Finished(Result<Result<Outcome, SessionError>, JoinError>),
}

fn submit_result(finished: Result<Result<Outcome, SessionError>, JoinError>) -> SubmitResult {
    match finished {
        Ok(Ok(outcome)) => SubmitResult {
            outcome: Some(outcome),
            error: None,
        },
        Ok(Err(err)) => SubmitResult {
            outcome: None,
            error: Some(err.to_string()),
        },
        Err(err) => {
            error!("Submission task failed: {err}");
            SubmitResult {
                outcome: None,
                error: Some(err.to_string()),
            }
        }
    }
}

fn intent_response(
    session: &Ref<dyn ChatService>,
    result: Result<Result<Outcome, SessionError>, JoinError>,
) -> (StatusCode, Json<IntentResponse>) {
    let (status, outcome, error) = match result {
        Ok(Ok(outcome)) => (StatusCode::OK, Some(outcome), None),
        Ok(Err(err)) => (StatusCode::BAD_GATEWAY, None, Some(err.to_string())),
        Err(err) => {
            error!("Session task failed: {err}");
            (StatusCode::INTERNAL_SERVER_ERROR, None, Some(err.to_string()))
        }
    };

    (
        status,
        Json(IntentResponse {
            outcome,
            error,
            session: session.snapshot(),
        }),
    )
}

fn state_event(snapshot: &SessionSnapshot) -> Event {
    json_event("state", snapshot)
}

fn json_event<T: serde::Serialize>(name: &str, data: &T) -> Event {
    match Event::default().event(name).json_data(data) {
        Ok(event) => event,
        Err(err) => {
            error!("Failed to encode {name} event: {err}");
            Event::default().event("error").data(err.to_string())
        }
    }
}

pub mod schemas {
    use crate::core::session::{Outcome, SessionSnapshot};
    use serde::{Deserialize, Serialize};

    #[derive(Deserialize, Debug)]
    pub struct SelectModel {
        pub model_id: String,
    }

    #[derive(Deserialize, Debug)]
    pub struct SubmitMessage {
        pub text: String,
    }

    #[derive(Serialize, Debug)]
    pub struct IntentResponse {
        pub outcome: Option<Outcome>,
        pub error: Option<String>,
        pub session: SessionSnapshot,
    }

    #[derive(Serialize, Debug)]
    pub struct SubmitResult {
        pub outcome: Option<Outcome>,
        pub error: Option<String>,
    }
}
