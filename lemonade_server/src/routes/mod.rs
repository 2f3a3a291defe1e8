//! Axum router construction.
//!
//! The OpenAI-compatible surface is mounted under both `/api/v1` and `/v1`;
//! request bodies are capped, every request is traced, and CORS stays open
//! for local tooling.

pub mod health;
pub mod inference;
pub mod models;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::state::AppState;

/// Request size cap for JSON bodies.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

pub fn build(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/health", get(health::health))
        .route("/stats", get(health::stats))
        .route("/models", get(models::list_models))
        .route("/models/{name}", delete(models::delete_model))
        .route("/pull", post(models::pull))
        .route("/register", post(models::register))
        .route("/chat/completions", post(inference::chat_completions))
        .route("/completions", post(inference::completions))
        .route("/responses", post(inference::responses))
        .route("/embeddings", post(inference::embeddings))
        .route("/reranking", post(inference::reranking));

    Router::new()
        .nest("/api/v1", api.clone())
        .nest("/v1", api)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_headers(Any).allow_methods(Any))
        .with_state(state)
}
