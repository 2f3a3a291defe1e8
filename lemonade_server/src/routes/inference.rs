//! Inference routes: chat, completion, responses, embeddings, reranking.
//!
//! All five share one shape: validate the JSON body, make sure the named
//! model is the active one (loading it through the router if not), ask the
//! router for a dispatch target, then proxy – buffered for ordinary
//! requests, chunk-for-chunk SSE pass-through when `stream: true`.

use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::header,
    response::Response,
};
use futures::StreamExt;
use lemonade_models::FetchError;
use lemonade_router::{Capability, DispatchTarget, LoadRequest};

use crate::{
    error::{GatewayError, GatewayResult},
    sse::{self, SseSplitter, DONE_MARKER},
    state::AppState,
};

/// Generations can legitimately run for many minutes.
const PROXY_TIMEOUT: Duration = Duration::from_secs(600);

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> GatewayResult<Response> {
    infer(state, body, Capability::Chat).await
}

pub async fn completions(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> GatewayResult<Response> {
    infer(state, body, Capability::Completion).await
}

pub async fn responses(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> GatewayResult<Response> {
    infer(state, body, Capability::Responses).await
}

pub async fn embeddings(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> GatewayResult<Response> {
    infer(state, body, Capability::Embeddings).await
}

pub async fn reranking(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> GatewayResult<Response> {
    infer(state, body, Capability::Reranking).await
}

async fn infer(
    state: Arc<AppState>,
    body: Bytes,
    op: Capability,
) -> GatewayResult<Response> {
    let req: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::ParseError(format!("request body is not valid JSON: {e}")))?;
    validate(&req, op)?;

    let model = req["model"].as_str().unwrap_or_default().to_owned();
    ensure_loaded(&state, &model).await?;

    let target = state.router.dispatch(op)?;

    let wants_stream = req.get("stream").and_then(|s| s.as_bool()).unwrap_or(false);
    let can_stream = matches!(
        op,
        Capability::Chat | Capability::Completion | Capability::Responses
    );

    if wants_stream && can_stream {
        proxy_stream(state, target, req).await
    } else {
        proxy_buffered(state, target, req).await
    }
}

/// Structural validation; semantic validation is the backend's job and its
/// error bodies pass through verbatim.
fn validate(req: &serde_json::Value, op: Capability) -> GatewayResult<()> {
    if !req.is_object() {
        return Err(GatewayError::InvalidRequest(
            "request body must be a JSON object".into(),
        ));
    }
    match req.get("model").and_then(|m| m.as_str()) {
        Some(m) if !m.is_empty() => {}
        _ => {
            return Err(GatewayError::InvalidRequest(
                "missing required field 'model'".into(),
            ));
        }
    }

    let require = |field: &str| -> GatewayResult<()> {
        if req.get(field).is_none() {
            return Err(GatewayError::InvalidRequest(format!(
                "missing required field '{field}'"
            )));
        }
        Ok(())
    };

    match op {
        Capability::Chat => {
            match req.get("messages").and_then(|m| m.as_array()) {
                Some(messages) if !messages.is_empty() => Ok(()),
                Some(_) => Err(GatewayError::InvalidRequest(
                    "'messages' must not be empty".into(),
                )),
                None => Err(GatewayError::InvalidRequest(
                    "missing required field 'messages'".into(),
                )),
            }
        }
        Capability::Completion => require("prompt"),
        Capability::Embeddings => require("input"),
        Capability::Reranking => {
            require("query")?;
            require("documents")
        }
        // backend-defined pass-through
        Capability::Responses | Capability::Transcription => Ok(()),
    }
}

/// Load the named model if it is not the active one. The router serialises
/// concurrent loads; we only hop off the async runtime for the blocking
/// wait.
async fn ensure_loaded(state: &Arc<AppState>, name: &str) -> GatewayResult<()> {
    if state
        .router
        .loaded_model()
        .is_some_and(|m| m.name == name)
    {
        return Ok(());
    }

    let entry = state.registry.get(name)?;
    if !state.registry.is_downloaded(&entry) {
        return Err(GatewayError::InvalidRequest(format!(
            "model '{name}' is not downloaded; pull it first"
        )));
    }

    let router = Arc::clone(&state.router);
    let req = LoadRequest {
        entry,
        ctx_size: state.config.ctx_size,
    };
    tokio::task::spawn_blocking(move || router.load(req))
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))??;
    Ok(())
}

/// Non-streaming: await the whole upstream body and relay it, status and
/// all, so backend-native error bodies reach the client verbatim.
async fn proxy_buffered(
    state: Arc<AppState>,
    target: DispatchTarget,
    req: serde_json::Value,
) -> GatewayResult<Response> {
    let (status, body) = state
        .fetcher
        .post_passthrough(&target.url, &req, PROXY_TIMEOUT)
        .await
        .map_err(|e| upstream_error(&state, e))?;

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .map_err(|e| GatewayError::Internal(e.to_string()))
}

/// Streaming: open the upstream SSE stream (status checked before we commit
/// to a 200 downstream), then forward `data:` payloads chunk-for-chunk. A
/// downstream disconnect drops the body stream, which aborts the upstream
/// transfer; the backend stays alive and is not marked crashed.
async fn proxy_stream(
    state: Arc<AppState>,
    target: DispatchTarget,
    req: serde_json::Value,
) -> GatewayResult<Response> {
    let upstream = state
        .fetcher
        .post_stream_response(&target.url, &req, PROXY_TIMEOUT)
        .await
        .map_err(|e| upstream_error(&state, e))?;

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        let mut splitter = SseSplitter::new();
        let mut chunks = upstream.bytes_stream();
        while let Some(item) = chunks.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                // A transport error after the final event is normal
                // end-of-stream for these servers.
                Err(e) => {
                    tracing::debug!("upstream stream ended with {e}; treating as EOF");
                    break;
                }
            };
            for payload in splitter.push(&chunk) {
                if tx.send(sse::data_frame(&payload)).is_err() {
                    // Downstream hung up: dropping `chunks` aborts the
                    // upstream transfer.
                    return;
                }
            }
        }
        if !splitter.saw_done() {
            let _ = tx.send(sse::data_frame(DONE_MARKER));
        }
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|frame| (Ok::<_, Infallible>(Bytes::from(frame)), rx))
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .map_err(|e| GatewayError::Internal(e.to_string()))
}

/// Map an upstream transport failure, reaping a crashed backend on the way
/// so the next request sees `model_not_loaded`.
fn upstream_error(state: &Arc<AppState>, e: FetchError) -> GatewayError {
    match e {
        FetchError::Request { .. } if state.router.reap_if_crashed() => {
            GatewayError::BackendCrashed
        }
        FetchError::Status { status, url } => {
            GatewayError::BackendFailed(format!("upstream returned HTTP {status} for {url}"))
        }
        other => GatewayError::BackendFailed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validate_requires_model_everywhere() {
        for op in [
            Capability::Chat,
            Capability::Completion,
            Capability::Embeddings,
            Capability::Reranking,
            Capability::Responses,
        ] {
            let err = validate(&json!({}), op).unwrap_err();
            assert!(matches!(err, GatewayError::InvalidRequest(_)), "{op}");
        }
    }

    #[test]
    fn validate_per_operation_fields() {
        let ok = validate(
            &json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]}),
            Capability::Chat,
        );
        assert!(ok.is_ok());

        assert!(validate(&json!({"model": "m", "messages": []}), Capability::Chat).is_err());
        assert!(validate(&json!({"model": "m"}), Capability::Completion).is_err());
        assert!(validate(&json!({"model": "m", "prompt": "hi"}), Capability::Completion).is_ok());
        assert!(validate(&json!({"model": "m", "input": "hi"}), Capability::Embeddings).is_ok());
        assert!(
            validate(&json!({"model": "m", "query": "q"}), Capability::Reranking).is_err()
        );
        assert!(validate(
            &json!({"model": "m", "query": "q", "documents": ["d"]}),
            Capability::Reranking
        )
        .is_ok());
        // responses is backend-defined pass-through
        assert!(validate(&json!({"model": "m"}), Capability::Responses).is_ok());
    }

    #[test]
    fn non_object_bodies_are_rejected() {
        assert!(validate(&json!([1, 2, 3]), Capability::Chat).is_err());
        assert!(validate(&json!("hi"), Capability::Completion).is_err());
    }
}
