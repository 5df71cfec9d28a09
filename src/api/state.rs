//! Application state shared across handlers.

use std::path::PathBuf;
use std::sync::Arc;

use crate::bridge::BridgeService;

/// State handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<BridgeService>,
    /// Directory served under the download route.
    pub artifacts_dir: PathBuf,
    /// Explicitly allowed CORS origins. Empty means permissive.
    pub allowed_origins: Vec<String>,
}

impl AppState {
    pub fn new(bridge: Arc<BridgeService>) -> Self {
        let artifacts_dir = bridge.config().artifacts_dir.clone();
        Self {
            bridge,
            artifacts_dir,
            allowed_origins: Vec::new(),
        }
    }

    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = origins;
        self
    }
}
