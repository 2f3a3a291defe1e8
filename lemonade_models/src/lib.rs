//! lemonade_models – model catalog and artifact management
//! ========================================================
//!
//! Everything the router needs to answer "which models exist, which are on
//! disk, and how do I get the rest":
//!
//! * **Catalog** – a read-only built-in catalog merged with a user-editable
//!   `user_models.json`; user entries live under the reserved `user.` prefix.
//! * **Hub cache** – Hugging Face-hub style on-disk layout
//!   (`models--org--repo/snapshots/<rev>/…`) rooted at the per-user cache
//!   directory.
//! * **Fetcher** – resumable, retrying HTTP downloads plus streaming request
//!   helpers used for SSE pass-through.
//! * **Registry** – the high-level surface (`list_supported`,
//!   `list_downloaded`, `register_user`, `download`, `delete`) consumed by
//!   the gateway and the CLI.

#[allow(unused_imports)]
use tracing::{debug, error, info, trace, warn};

pub mod catalog;
pub mod entry;
pub mod error;
pub mod fetch;
pub mod hub;
pub mod registry;

pub use catalog::{Catalog, UserCatalog};
pub use entry::{Checkpoint, CheckpointSource, Label, ModelEntry, Recipe};
pub use error::{ModelsError, ModelsResult};
pub use fetch::{CancelToken, DownloadOutcome, Fetcher, FetchError, RetryPolicy};
pub use hub::HubCache;
pub use registry::{DownloadEvent, DownloadStatus, ModelRegistry, PullOptions};
