//! Live event stream.
//!
//! `GET /v1/events` streams the merged desired and actual event sequence as
//! newline-delimited JSON frames. `cell_id` narrows actual LRP events to one
//! cell; desired LRP events always pass.

use std::convert::Infallible;

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header::CONTENT_TYPE, HeaderValue},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::stream::unfold;
use lrp_events::EventFilter;
use lrp_id::CellId;
use serde::Deserialize;
use tracing::{debug, error, info};

use crate::api::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct StreamEventsQuery {
    pub cell_id: Option<String>,
}

pub async fn stream_events(
    State(state): State<AppState>,
    Query(query): Query<StreamEventsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = match query.cell_id.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => {
            let cell_id = CellId::parse(raw)
                .map_err(|e| ApiError::bad_request("invalid_cell_id", e.to_string()))?;
            EventFilter::for_cell(cell_id)
        }
        None => EventFilter::all(),
    };
    debug!(cell_id = ?filter.cell_id(), "Opening event stream");

    let events = state.streamer().open(&state.hubs(), filter)?;

    let stream = unfold(events, |mut events| async move {
        match events.next().await? {
            Ok(frame) => match serde_json::to_vec(&frame) {
                Ok(mut line) => {
                    line.push(b'\n');
                    Some((Ok::<Bytes, Infallible>(Bytes::from(line)), events))
                }
                Err(e) => {
                    error!(error = %e, "Failed to serialize stream frame");
                    None
                }
            },
            Err(e) => {
                info!(error = %e, "Event stream ended");
                None
            }
        }
    });

    let body = Body::from_stream(stream);
    let mut response = Response::new(body);
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/x-ndjson"),
    );
    Ok(response)
}
