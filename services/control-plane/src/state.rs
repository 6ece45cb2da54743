//! Application state shared across request handlers.

use std::sync::Arc;

use crate::store::StateManager;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    manager: Arc<StateManager>,
}

impl AppState {
    /// Create a new application state around a state manager.
    pub fn new(manager: StateManager) -> Self {
        Self {
            manager: Arc::new(manager),
        }
    }

    /// Get a reference to the state manager.
    pub fn manager(&self) -> &StateManager {
        &self.manager
    }
}
