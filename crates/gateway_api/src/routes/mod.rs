use axum::Router;

use crate::state::AppState;

pub mod delivery_callbacks;
pub mod delivery_orders;

/// Order-management endpoints plus the platform-facing callback endpoints.
pub fn router() -> Router<AppState> {
    Router::new()
        .merge(delivery_orders::router())
        .merge(delivery_callbacks::router())
}
