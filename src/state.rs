//! Application state management

use std::sync::Arc;

use crate::config::Config;
use crate::upload::UploadCoordinator;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    coordinator: UploadCoordinator,
}

impl AppState {
    /// Create a new application state
    pub fn new(config: Config, coordinator: UploadCoordinator) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                config,
                coordinator,
            }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the upload coordinator
    pub fn coordinator(&self) -> &UploadCoordinator {
        &self.inner.coordinator
    }
}
