use crate::config::{ChatConfig, ModelRecord};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use di_axum::Inject;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

pub mod session;

/// Front-end origins allowed to call the API during development.
const DEV_ORIGINS: [&str; 2] = ["http://localhost:3000", "http://localhost:5173"];

#[derive(Serialize, Debug)]
pub struct ModelCatalog {
    pub models: Vec<ModelRecord>,
}

/// All routes, without a service provider attached.
pub fn router() -> Router {
    Router::new()
        .route("/models", get(list_models))
        .nest("/session", session::router())
        .layer(
            CorsLayer::new()
                .allow_headers(Any)
                .allow_methods([Method::GET, Method::POST, Method::PUT])
                .allow_origin(DEV_ORIGINS.map(HeaderValue::from_static)),
        )
}

async fn list_models(Inject(config): Inject<ChatConfig>) -> (StatusCode, Json<ModelCatalog>) {
    (
        StatusCode::OK,
        Json(ModelCatalog {
            models: config.model_list.clone(),
        }),
    )
}
