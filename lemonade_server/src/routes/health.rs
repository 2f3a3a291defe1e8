use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::json;

use crate::state::AppState;

/// `GET /health` – gateway liveness plus the loaded model, if any.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let loaded = state.router.loaded_model();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "model_loaded": loaded.map(|m| m.name),
    }))
}

/// `GET /stats` – last telemetry observed on backend stdout.
pub async fn stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let snapshot = state.router.telemetry_snapshot();
    let loaded = state.router.loaded_model();
    Json(json!({
        "model": loaded.map(|m| m.name),
        "input_tokens": snapshot.input_tokens,
        "output_tokens": snapshot.output_tokens,
        "time_to_first_token_ms": snapshot.time_to_first_token_ms,
        "tokens_per_second": snapshot.tokens_per_second,
        "decode_token_time_ms": snapshot.decode_token_time_ms,
    }))
}
