//! Shared application state passed to every handler via Axum's `State`
//! extractor.

use std::sync::Arc;

use crate::service::WatcherService;

/// Shared application state for the tailcast server.
#[derive(Clone)]
pub struct AppState {
    /// The orchestrator owning all mutable session state.
    pub service: Arc<WatcherService>,
}

impl AppState {
    pub fn new(service: Arc<WatcherService>) -> Self {
        Self { service }
    }
}
