//! Health check endpoints.
//!
//! These endpoints are used by load balancers and orchestration systems
//! to determine if the service is healthy and ready to receive traffic.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use lrp_events::{DesiredLrpFilter, EventHub};
use serde::Serialize;
use tracing::warn;

use crate::state::AppState;

const SERVICE: &str = "lrp-control-plane";

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Service status: "ok" or "degraded".
    pub status: String,

    pub service: String,

    pub version: String,

    /// Current timestamp (ISO 8601).
    pub timestamp: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub components: Option<ComponentHealth>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ComponentHealth {
    pub desired_hub: HubStatus,
    pub actual_hub: HubStatus,
    pub storage: StorageStatus,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HubStatus {
    /// "ok" or "closed".
    pub status: String,
    pub subscribers: usize,
    /// Per-subscriber queue length before eviction.
    pub capacity: usize,
}

impl HubStatus {
    fn of(hub: &EventHub) -> Self {
        Self {
            status: if hub.is_closed() { "closed" } else { "ok" }.to_string(),
            subscribers: hub.subscriber_count(),
            capacity: hub.capacity(),
        }
    }

    fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct StorageStatus {
    /// "ok" or "unavailable".
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_lrps: Option<usize>,
}

impl StorageStatus {
    async fn of(state: &AppState) -> Self {
        match state.reconciler().desired_lrps(&DesiredLrpFilter::default()).await {
            Ok(desired) => Self {
                status: "ok".to_string(),
                desired_lrps: Some(desired.len()),
            },
            Err(e) => {
                warn!(error = %e, "Storage readiness check failed");
                Self {
                    status: "unavailable".to_string(),
                    desired_lrps: None,
                }
            }
        }
    }

    fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
}

/// Is the process serving at all? Checks nothing else.
async fn healthz() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: SERVICE.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        components: None,
    })
}

/// Ready while both event hubs accept subscribers and storage answers
/// reads. Returns 503 once the hubs have been closed for shutdown.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let components = ComponentHealth {
        desired_hub: HubStatus::of(state.desired_hub()),
        actual_hub: HubStatus::of(state.actual_hub()),
        storage: StorageStatus::of(&state).await,
    };
    let all_ok = components.desired_hub.is_ok()
        && components.actual_hub.is_ok()
        && components.storage.is_ok();

    let response = HealthResponse {
        status: if all_ok { "ok" } else { "degraded" }.to_string(),
        service: SERVICE.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        components: Some(components),
    };

    if all_ok {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

async fn livez() -> impl IntoResponse {
    StatusCode::OK
}
