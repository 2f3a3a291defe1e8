//! Realtime WebSocket endpoint (`/realtime?intent=transcription`)
//! ==============================================================
//!
//! Served on HTTP port + 100. The gateway validates and forwards the fixed
//! message protocol; audio capture and buffering live in the client. The
//! session state machine is pure ([`RealtimeSession`]) so the protocol is
//! testable without a socket:
//!
//! * client → `transcription_session.update|create`,
//!   `input_audio_buffer.append|commit|clear`
//! * server → `input_audio_buffer.speech_started|stopped|committed|cleared`,
//!   `conversation.item.input_audio_transcription.completed`, `error`
//!
//! Committed audio dispatches to the active backend's transcription
//! capability; backends without it produce a protocol `error` event.

use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use lemonade_router::Capability;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{error::GatewayError, state::AppState};

const TRANSCRIBE_TIMEOUT: Duration = Duration::from_secs(120);

/// What the session loop must do after handling one client message.
#[derive(Debug, PartialEq)]
pub enum Action {
    None,
    /// Forward the committed audio (still base64) to the backend.
    Transcribe(String),
}

/// Per-connection protocol state. Sessions are independent; no state is
/// shared across connections.
#[derive(Debug)]
pub struct RealtimeSession {
    id: String,
    /// Concatenated base64 audio since the last commit/clear.
    audio: String,
    speech_open: bool,
}

impl RealtimeSession {
    pub fn new() -> Self {
        Self {
            id: format!("sess_{}", Uuid::new_v4()),
            audio: String::new(),
            speech_open: false,
        }
    }

    pub fn created_event(&self) -> Value {
        json!({
            "type": "transcription_session.created",
            "session": { "id": self.id },
        })
    }

    /// Handle one client message; returns the server events to emit plus
    /// any follow-up action.
    pub fn handle(&mut self, msg: &Value) -> (Vec<Value>, Action) {
        let Some(kind) = msg.get("type").and_then(|t| t.as_str()) else {
            return (
                vec![protocol_error("message is missing a 'type' field")],
                Action::None,
            );
        };

        match kind {
            "transcription_session.create" | "transcription_session.update" => {
                let event = if kind.ends_with("create") {
                    "transcription_session.created"
                } else {
                    "transcription_session.updated"
                };
                (
                    vec![json!({ "type": event, "session": { "id": self.id } })],
                    Action::None,
                )
            }

            "input_audio_buffer.append" => {
                let Some(audio) = msg.get("audio").and_then(|a| a.as_str()) else {
                    return (
                        vec![protocol_error("append requires an 'audio' field")],
                        Action::None,
                    );
                };
                let mut events = Vec::new();
                if !self.speech_open {
                    self.speech_open = true;
                    events.push(json!({ "type": "input_audio_buffer.speech_started" }));
                }
                self.audio.push_str(audio);
                (events, Action::None)
            }

            "input_audio_buffer.commit" => {
                if self.audio.is_empty() {
                    return (
                        vec![protocol_error("commit on an empty audio buffer")],
                        Action::None,
                    );
                }
                self.speech_open = false;
                let audio = std::mem::take(&mut self.audio);
                let item_id = format!("item_{}", Uuid::new_v4());
                (
                    vec![
                        json!({ "type": "input_audio_buffer.speech_stopped" }),
                        json!({ "type": "input_audio_buffer.committed", "item_id": item_id }),
                    ],
                    Action::Transcribe(audio),
                )
            }

            "input_audio_buffer.clear" => {
                self.audio.clear();
                self.speech_open = false;
                (
                    vec![json!({ "type": "input_audio_buffer.cleared" })],
                    Action::None,
                )
            }

            other => (
                vec![protocol_error(&format!("unknown message type '{other}'"))],
                Action::None,
            ),
        }
    }
}

impl Default for RealtimeSession {
    fn default() -> Self {
        Self::new()
    }
}

fn protocol_error(message: &str) -> Value {
    json!({
        "type": "error",
        "error": { "message": message, "type": "invalid_request" },
    })
}

fn gateway_error_event(e: GatewayError) -> Value {
    let body = e.to_body();
    json!({ "type": "error", "error": body["error"] })
}

/// `GET /realtime?intent=transcription` – the only supported intent.
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    if params.get("intent").map(String::as_str) != Some("transcription") {
        return (
            StatusCode::BAD_REQUEST,
            "unsupported intent; use ?intent=transcription",
        )
            .into_response();
    }
    ws.on_upgrade(move |socket| session_loop(state, socket))
}

async fn session_loop(state: Arc<AppState>, mut socket: WebSocket) {
    let mut session = RealtimeSession::new();

    if send_event(&mut socket, session.created_event()).await.is_err() {
        return;
    }

    while let Some(Ok(msg)) = socket.recv().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            // pings are answered by axum; binary frames are not part of
            // this protocol
            _ => continue,
        };

        let value: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(e) => {
                let event = protocol_error(&format!("invalid JSON: {e}"));
                if send_event(&mut socket, event).await.is_err() {
                    return;
                }
                continue;
            }
        };

        let (events, action) = session.handle(&value);
        for event in events {
            if send_event(&mut socket, event).await.is_err() {
                return;
            }
        }

        if let Action::Transcribe(audio) = action {
            let event = transcribe(&state, audio).await;
            if send_event(&mut socket, event).await.is_err() {
                return;
            }
        }
    }
}

async fn send_event(socket: &mut WebSocket, event: Value) -> Result<(), axum::Error> {
    socket.send(Message::Text(event.to_string().into())).await
}

/// Forward committed audio to the active backend's transcription route.
async fn transcribe(state: &Arc<AppState>, audio_b64: String) -> Value {
    let target = match state.router.dispatch(Capability::Transcription) {
        Ok(target) => target,
        Err(e) => return gateway_error_event(e.into()),
    };

    let body = json!({ "model": target.model_name, "audio": audio_b64 });
    match state
        .fetcher
        .post_json(&target.url, &body, TRANSCRIBE_TIMEOUT)
        .await
    {
        Ok(resp) => {
            let transcript = resp
                .get("text")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_owned();
            json!({
                "type": "conversation.item.input_audio_transcription.completed",
                "item_id": format!("item_{}", Uuid::new_v4()),
                "transcript": transcript,
            })
        }
        Err(e) => gateway_error_event(GatewayError::BackendFailed(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types(events: &[Value]) -> Vec<String> {
        events
            .iter()
            .map(|e| e["type"].as_str().unwrap_or_default().to_owned())
            .collect()
    }

    #[test]
    fn append_commit_cycle() {
        let mut session = RealtimeSession::new();

        let (events, action) =
            session.handle(&json!({"type": "input_audio_buffer.append", "audio": "AAAA"}));
        assert_eq!(types(&events), ["input_audio_buffer.speech_started"]);
        assert_eq!(action, Action::None);

        // second append does not re-announce speech
        let (events, _) =
            session.handle(&json!({"type": "input_audio_buffer.append", "audio": "BBBB"}));
        assert!(events.is_empty());

        let (events, action) = session.handle(&json!({"type": "input_audio_buffer.commit"}));
        assert_eq!(
            types(&events),
            ["input_audio_buffer.speech_stopped", "input_audio_buffer.committed"]
        );
        assert_eq!(action, Action::Transcribe("AAAABBBB".into()));

        // buffer was consumed; another commit is a protocol error
        let (events, action) = session.handle(&json!({"type": "input_audio_buffer.commit"}));
        assert_eq!(types(&events), ["error"]);
        assert_eq!(action, Action::None);
    }

    #[test]
    fn clear_resets_buffer_and_speech() {
        let mut session = RealtimeSession::new();
        session.handle(&json!({"type": "input_audio_buffer.append", "audio": "AAAA"}));

        let (events, _) = session.handle(&json!({"type": "input_audio_buffer.clear"}));
        assert_eq!(types(&events), ["input_audio_buffer.cleared"]);

        // speech re-opens on the next append
        let (events, _) =
            session.handle(&json!({"type": "input_audio_buffer.append", "audio": "CCCC"}));
        assert_eq!(types(&events), ["input_audio_buffer.speech_started"]);
    }

    #[test]
    fn session_create_and_update() {
        let mut session = RealtimeSession::new();
        let (events, _) = session.handle(&json!({"type": "transcription_session.create"}));
        assert_eq!(types(&events), ["transcription_session.created"]);

        let (events, _) = session.handle(&json!({"type": "transcription_session.update"}));
        assert_eq!(types(&events), ["transcription_session.updated"]);
    }

    #[test]
    fn malformed_messages_become_error_events() {
        let mut session = RealtimeSession::new();

        let (events, _) = session.handle(&json!({"no_type": true}));
        assert_eq!(types(&events), ["error"]);

        let (events, _) = session.handle(&json!({"type": "input_audio_buffer.append"}));
        assert_eq!(types(&events), ["error"]);

        let (events, _) = session.handle(&json!({"type": "response.create"}));
        assert_eq!(types(&events), ["error"]);
    }
}
