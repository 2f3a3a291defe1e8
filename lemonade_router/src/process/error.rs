#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("{action} failed: {source}")]
    CommandFailed {
        action: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("permission denied while trying to {action}: {source}")]
    PermissionDenied {
        action: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("{operation} did not finish within {elapsed:?}; PIDs still alive: {leftovers:?}")]
    TerminationTimeout {
        operation: &'static str,
        elapsed: std::time::Duration,
        leftovers: Vec<u32>,
    },

    #[error("no process matched query '{query}'")]
    NoSuchProcess { query: String },
}

pub type Result<T> = std::result::Result<T, ProcessError>;
