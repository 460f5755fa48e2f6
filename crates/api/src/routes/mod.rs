pub mod health;
pub mod queues;
pub mod sends;

use axum::Router;

use crate::state::AppState;

/// Build the complete API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(queues::router())
        .merge(sends::router())
        .with_state(state)
}
