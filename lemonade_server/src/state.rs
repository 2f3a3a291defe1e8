use std::sync::Arc;

use lemonade_models::{Fetcher, ModelRegistry};
use lemonade_router::{Router, ServerConfig};

/// Shared application state handed to every handler. Router and registry
/// are passed in from `main`; the gateway owns no hidden globals.
#[derive(Debug)]
pub struct AppState {
    pub config: ServerConfig,
    pub router: Arc<Router>,
    pub registry: Arc<ModelRegistry>,
    /// Async HTTP used to proxy inference bodies to the active backend.
    pub fetcher: Fetcher,
}

impl AppState {
    pub fn new(config: ServerConfig, router: Arc<Router>, registry: Arc<ModelRegistry>) -> Self {
        Self {
            config,
            router,
            registry,
            fetcher: Fetcher::default(),
        }
    }
}
