// top-level error for the public API

use crate::backend::Capability;

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error(transparent)]
    Process(#[from] crate::process::error::ProcessError),

    #[error(transparent)]
    Models(#[from] lemonade_models::ModelsError),

    #[error("no model is loaded")]
    ModelNotLoaded,

    #[error("operation '{op}' is not supported by recipe '{recipe}'")]
    UnsupportedOperation {
        op: Capability,
        recipe: lemonade_models::Recipe,
    },

    #[error("backend failed to start: {0}")]
    BackendFailed(String),

    #[error("backend did not become ready within {elapsed:?}")]
    BackendStartTimeout { elapsed: std::time::Duration },

    #[error("backend process crashed")]
    BackendCrashed,

    #[error("load was cancelled by shutdown")]
    LoadCancelled,

    #[error("another instance is already running (PID {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("invalid {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error("{operation} failed for '{path}'")]
    FileSystem {
        operation: &'static str,
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type RouterResult<T> = std::result::Result<T, RouterError>;

impl RouterError {
    pub fn file_system(
        operation: &'static str,
        path: impl Into<std::path::PathBuf>,
        err: impl Into<std::io::Error>,
    ) -> Self {
        Self::FileSystem {
            operation,
            path: path.into(),
            source: err.into(),
        }
    }
}
