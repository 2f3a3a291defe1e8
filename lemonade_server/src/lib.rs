//! lemonade_server – the public face of the router
//! ===============================================
//!
//! An OpenAI-compatible HTTP surface (`/api/v1` and `/v1`) over the router
//! and registry, a WebSocket realtime endpoint on `port + 100`, and the
//! `lemonade-server` CLI (serve/run/list/pull/delete/status/stop).

#[allow(unused_imports)]
use tracing::{debug, error, info, trace, warn};

pub mod cli;
pub mod commands;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod realtime;
pub mod routes;
pub mod serve;
pub mod sse;
pub mod state;

pub use error::{GatewayError, GatewayResult};
pub use state::AppState;
