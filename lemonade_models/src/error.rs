// top-level error for the public API

#[derive(Debug, thiserror::Error)]
pub enum ModelsError {
    #[error(transparent)]
    Entry(#[from] crate::entry::EntryError),

    #[error(transparent)]
    Fetch(#[from] crate::fetch::FetchError),

    #[error("unknown model '{name}'")]
    UnknownModel { name: String },

    #[error("model '{name}' is already registered")]
    DuplicateModel { name: String },

    #[error("recipe '{recipe}' is not supported on this host")]
    UnsupportedRecipe { recipe: String },

    #[error("catalog is malformed: {reason}")]
    MalformedCatalog { reason: String },

    #[error("{operation} failed for '{path}'")]
    FileSystem {
        operation: &'static str,
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type ModelsResult<T> = std::result::Result<T, ModelsError>;

impl ModelsError {
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
