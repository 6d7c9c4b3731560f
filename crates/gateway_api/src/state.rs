use std::sync::Arc;

use crate::gateway::Gateway;

/// Shared app state for Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    /// `mysql` or `memory`, reported by the health route.
    pub store_backend: &'static str,
    pub trust_forwarded_for: bool,
}
