//! API v1 routes.

mod events;

use axum::{routing::get, Router};

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/events", get(events::stream_events))
}
