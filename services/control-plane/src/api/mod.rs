//! HTTP API handlers and routing.
//!
//! Health checks plus the event stream. Lifecycle and desired LRP
//! operations are driven in-process.

pub mod error;
mod health;
mod v1;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the main API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::routes())
        .nest("/v1", v1::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
pub(crate) fn test_state() -> AppState {
    test_state_from(&crate::test_support::Harness::new())
}

#[cfg(test)]
pub(crate) fn test_state_from(h: &crate::test_support::Harness) -> AppState {
    AppState::new(
        h.desired_hub.clone(),
        h.actual_hub.clone(),
        crate::stream::Streamer::new(16),
        h.reconciler.clone(),
    )
}
