//! SSE pass-through framing
//! ========================
//!
//! The upstream backend speaks server-sent events; we forward its `data:`
//! payloads chunk-for-chunk without materializing the body. The splitter is
//! byte-oriented: it buffers partial lines across arbitrary chunk
//! boundaries, recognizes `data:` fields, and re-frames each payload for
//! the downstream client as `data: <payload>\n\n`.
//!
//! `event:` lines and comments are consumed to preserve event boundaries
//! but are not forwarded; clients of the OpenAI-compatible surface key off
//! the JSON payloads and the final `data: [DONE]` marker.

/// Marker terminating an OpenAI-style SSE stream.
pub const DONE_MARKER: &str = "[DONE]";

#[derive(Debug, Default)]
pub struct SseSplitter {
    buf: Vec<u8>,
    /// Whether a `[DONE]` payload has already passed through.
    saw_done: bool,
}

impl SseSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one upstream chunk; returns the complete `data:` payloads it
    /// finished.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut payloads = Vec::new();
        while let Some(newline) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            if let Some(payload) = line.strip_prefix("data:") {
                let payload = payload.strip_prefix(' ').unwrap_or(payload);
                if payload == DONE_MARKER {
                    self.saw_done = true;
                }
                payloads.push(payload.to_owned());
            }
            // `event:` lines, comments and blank separators are boundary
            // markers only; nothing to forward.
        }
        payloads
    }

    pub fn saw_done(&self) -> bool {
        self.saw_done
    }
}

/// Frame one payload for the downstream client.
pub fn data_frame(payload: &str) -> String {
    format!("data: {payload}\n\n")
}

/// Frame a named event (used by `/pull` progress streams).
pub fn event_frame(event: &str, payload: &str) -> String {
    format!("event: {event}\ndata: {payload}\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_whole_events() {
        let mut splitter = SseSplitter::new();
        let payloads = splitter.push(b"data: {\"a\":1}\n\ndata: {\"b\":2}\n\n");
        assert_eq!(payloads, vec![r#"{"a":1}"#, r#"{"b":2}"#]);
    }

    #[test]
    fn buffers_across_chunk_boundaries() {
        let mut splitter = SseSplitter::new();
        assert!(splitter.push(b"da").is_empty());
        assert!(splitter.push(b"ta: {\"tok\":\"he").is_empty());
        let payloads = splitter.push(b"llo\"}\n\n");
        assert_eq!(payloads, vec![r#"{"tok":"hello"}"#]);
    }

    #[test]
    fn event_lines_are_consumed_not_forwarded() {
        let mut splitter = SseSplitter::new();
        let payloads = splitter.push(b"event: message\ndata: {\"x\":1}\n\n: keep-alive\n\n");
        assert_eq!(payloads, vec![r#"{"x":1}"#]);
    }

    #[test]
    fn crlf_lines_are_tolerated() {
        let mut splitter = SseSplitter::new();
        let payloads = splitter.push(b"data: one\r\n\r\ndata: two\r\n\r\n");
        assert_eq!(payloads, vec!["one", "two"]);
    }

    #[test]
    fn done_marker_is_tracked() {
        let mut splitter = SseSplitter::new();
        assert!(!splitter.saw_done());
        let payloads = splitter.push(b"data: {\"last\":true}\n\ndata: [DONE]\n\n");
        assert_eq!(payloads, vec![r#"{"last":true}"#, "[DONE]"]);
        assert!(splitter.saw_done());
    }

    #[test]
    fn frames() {
        assert_eq!(data_frame("{}"), "data: {}\n\n");
        assert_eq!(
            event_frame("progress", "{\"percent\":50}"),
            "event: progress\ndata: {\"percent\":50}\n\n"
        );
    }
}
