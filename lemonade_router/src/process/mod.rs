//! Backend process supervision
//! ===========================
//!
//! Everything needed to own an inference-server subprocess for its whole
//! lifetime: spawning with child-tree containment, line-oriented
//! stdout/stderr pumping, liveness probes that treat zombies as dead, and a
//! polite-then-forceful termination ladder.

pub mod error;
pub mod guard;
pub mod kill;
pub mod pid;

pub use error::*;
pub use guard::*;
pub use kill::*;
pub use pid::*;

/// How long `stop` waits after the polite signal before force-killing.
pub const DEFAULT_GRACE: std::time::Duration = std::time::Duration::from_secs(2);
const POLL_INTERVAL_MS: u64 = 100;
const FORCE_KILL_TIMEOUT_SECS: u64 = 1;
