//! lemonade_router – backend supervision and routing
//! =================================================
//!
//! The process-shaped half of the gateway:
//!
//! * **process** – spawn an inference-server subprocess with its whole tree
//!   contained (process-group + PDEATHSIG, lifeline pipe, or NT Job object,
//!   depending on the platform), pump its stdout/stderr line-by-line, and
//!   guarantee clean-up on stop or drop.
//! * **backend** – the uniform capability surface over the three concrete
//!   server flavors (GGUF `llama-server`, the vendor OGA server, FastLM),
//!   each knowing its argv, readiness probe, and telemetry pattern.
//! * **router** – at most one active backend; FIFO-serialised loads that
//!   never starve readers; typed `ModelNotLoaded` / `UnsupportedOperation` /
//!   `BackendCrashed` dispatch errors.
//! * **single_instance** – advisory file lock plus the PID-port discovery
//!   file that `status`/`stop` read.

#[allow(unused_imports)]
use tracing::{debug, error, info, trace, warn};

pub mod backend;
pub mod config;
pub mod error;
pub mod process;
pub mod router;
pub mod single_instance;
pub mod telemetry;

pub use backend::{Backend, Capability, DispatchTarget, LoadRequest, LoadedModel};
pub use config::{LlamaCppFlavor, LogLevel, MaxLoaded, ServerConfig};
pub use error::{RouterError, RouterResult};
pub use router::Router;
pub use single_instance::InstanceLock;
pub use telemetry::{Telemetry, TelemetrySnapshot};
