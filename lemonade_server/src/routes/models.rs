//! Registry routes: list, pull (SSE progress), register, delete.

use std::{collections::BTreeSet, convert::Infallible, sync::Arc};

use axum::{
    body::Body,
    extract::{Path, State},
    http::header,
    response::Response,
    Json,
};
use bytes::Bytes;
use futures::StreamExt;
use lemonade_models::{
    Checkpoint, DownloadStatus, Label, ModelEntry, PullOptions, Recipe,
};
use serde::Deserialize;
use serde_json::json;

use crate::{
    error::{GatewayError, GatewayResult},
    sse,
    state::AppState,
};

/// `GET /models` – merged supported view with download status.
pub async fn list_models(
    State(state): State<Arc<AppState>>,
) -> GatewayResult<Json<serde_json::Value>> {
    let registry = Arc::clone(&state.registry);
    let supported = tokio::task::spawn_blocking(move || registry.list_supported())
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))??;

    let data: Vec<serde_json::Value> = supported
        .values()
        .map(|entry| {
            json!({
                "id": entry.name,
                "object": "model",
                "checkpoint": entry.checkpoint.as_str(),
                "recipe": entry.recipe,
                "labels": entry.labels,
                "suggested": entry.suggested,
                "downloaded": state.registry.is_downloaded(entry),
            })
        })
        .collect();

    Ok(Json(json!({ "object": "list", "data": data })))
}

/// `DELETE /models/{name}` – remove artifacts (and the catalog row for user
/// models).
pub async fn delete_model(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> GatewayResult<Json<serde_json::Value>> {
    let registry = Arc::clone(&state.registry);
    let router = Arc::clone(&state.router);
    let deleted = name.clone();
    tokio::task::spawn_blocking(move || {
        // Deleting the active model's files out from under its backend
        // would strand it; unload first.
        if router.loaded_model().is_some_and(|m| m.name == deleted) {
            router.unload();
        }
        registry.delete(&deleted)
    })
    .await
    .map_err(|e| GatewayError::Internal(e.to_string()))??;

    Ok(Json(json!({ "deleted": name })))
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub checkpoint: String,
    pub recipe: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub mmproj: Option<String>,
}

impl RegisterRequest {
    pub fn into_entry(self) -> GatewayResult<ModelEntry> {
        let checkpoint = Checkpoint::try_new(&self.checkpoint)
            .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;
        let recipe: Recipe = self
            .recipe
            .parse()
            .map_err(|e: lemonade_models::entry::EntryError| {
                GatewayError::InvalidRequest(e.to_string())
            })?;

        let mut labels: BTreeSet<Label> = BTreeSet::new();
        for raw in &self.labels {
            let label = serde_json::from_value::<Label>(json!(raw)).map_err(|_| {
                GatewayError::InvalidRequest(format!("unknown label '{raw}'"))
            })?;
            labels.insert(label);
        }
        // Registrations are user-supplied by definition.
        labels.insert(Label::Custom);

        Ok(ModelEntry {
            name: self.name,
            checkpoint,
            recipe,
            labels,
            mmproj: self.mmproj,
            suggested: false,
        })
    }
}

/// `POST /register` – add a user catalog entry.
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> GatewayResult<Json<serde_json::Value>> {
    let entry = req.into_entry()?;
    let registry = Arc::clone(&state.registry);
    let merged_name = tokio::task::spawn_blocking(move || registry.register_user(entry))
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))??;
    Ok(Json(json!({ "registered": merged_name })))
}

#[derive(Debug, Deserialize)]
pub struct PullRequest {
    pub model: String,
    #[serde(default)]
    pub do_not_upgrade: bool,
}

/// `POST /pull` – download a model's artifacts, streaming progress as SSE
/// `progress` / `complete` / `error` events.
pub async fn pull(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PullRequest>,
) -> GatewayResult<Response> {
    // Resolve before streaming so an unknown name is a plain 404.
    let _ = state.registry.get(&req.model)?;

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let registry = Arc::clone(&state.registry);
    let model = req.model.clone();
    let opts = PullOptions {
        do_not_upgrade: req.do_not_upgrade,
        ..PullOptions::default()
    };

    tokio::spawn(async move {
        // Terminal events (complete / cancelled / error) are emitted by the
        // registry itself before this returns.
        if let Err(e) = registry.pull(&model, &opts, &tx).await {
            tracing::error!("pull of '{model}' failed: {e}");
        }
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    })
    .map(|event| {
        let name = match event.status {
            DownloadStatus::Downloading => "progress",
            DownloadStatus::Completed => "complete",
            DownloadStatus::Cancelled | DownloadStatus::Error => "error",
        };
        let payload = serde_json::to_string(&event)
            .unwrap_or_else(|_| "{}".to_owned());
        Ok::<_, Infallible>(Bytes::from(sse::event_frame(name, &payload)))
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .map_err(|e| GatewayError::Internal(e.to_string()))
}
