//! Per-request telemetry parsed from backend stdout
//! ================================================
//!
//! Backends print generation statistics to stdout in their own formats;
//! each backend's `parse_telemetry` extracts token counts and timings from
//! one line at a time and records them here. The record is reset at every
//! new generation and the last observed values are served via `/stats`.

use std::sync::Mutex;

use serde::Serialize;

#[derive(Debug, Default, Clone, Serialize, PartialEq)]
pub struct TelemetrySnapshot {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    /// Milliseconds until the first generated token.
    pub time_to_first_token_ms: Option<f64>,
    pub tokens_per_second: Option<f64>,
    /// Mean per-token decode time for the last generation.
    pub decode_token_time_ms: Option<f64>,
}

/// Shared, thread-safe telemetry record. The stdout pump thread writes,
/// `/stats` reads.
#[derive(Debug, Default)]
pub struct Telemetry {
    inner: Mutex<TelemetrySnapshot>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called at the start of a new generation.
    pub fn reset(&self) {
        *self.inner.lock().expect("telemetry lock poisoned") = TelemetrySnapshot::default();
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.inner.lock().expect("telemetry lock poisoned").clone()
    }

    pub fn record_prompt(&self, tokens: u64, elapsed_ms: f64) {
        let mut inner = self.inner.lock().expect("telemetry lock poisoned");
        inner.input_tokens = Some(tokens);
        // First token lands right after prompt processing finishes.
        inner.time_to_first_token_ms = Some(elapsed_ms);
    }

    pub fn record_decode(&self, tokens: u64, per_token_ms: f64, tokens_per_second: f64) {
        let mut inner = self.inner.lock().expect("telemetry lock poisoned");
        inner.output_tokens = Some(tokens);
        inner.decode_token_time_ms = Some(per_token_ms);
        inner.tokens_per_second = Some(tokens_per_second);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_reset() {
        let telemetry = Telemetry::new();
        telemetry.record_prompt(15, 116.7);
        telemetry.record_decode(99, 13.8, 72.4);

        let snap = telemetry.snapshot();
        assert_eq!(snap.input_tokens, Some(15));
        assert_eq!(snap.output_tokens, Some(99));
        assert_eq!(snap.time_to_first_token_ms, Some(116.7));
        assert_eq!(snap.tokens_per_second, Some(72.4));

        telemetry.reset();
        assert_eq!(telemetry.snapshot(), TelemetrySnapshot::default());
    }
}
