//! Application state shared across request handlers.

use std::sync::Arc;

use lrp_events::EventHub;

use crate::desired::DesiredLrpReconciler;
use crate::stream::Streamer;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    desired_hub: EventHub,
    actual_hub: EventHub,
    streamer: Streamer,
    reconciler: DesiredLrpReconciler,
}

impl AppState {
    pub fn new(
        desired_hub: EventHub,
        actual_hub: EventHub,
        streamer: Streamer,
        reconciler: DesiredLrpReconciler,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                desired_hub,
                actual_hub,
                streamer,
                reconciler,
            }),
        }
    }

    pub fn desired_hub(&self) -> &EventHub {
        &self.inner.desired_hub
    }

    pub fn actual_hub(&self) -> &EventHub {
        &self.inner.actual_hub
    }

    /// Both hubs, desired first.
    pub fn hubs(&self) -> [EventHub; 2] {
        [self.inner.desired_hub.clone(), self.inner.actual_hub.clone()]
    }

    pub fn streamer(&self) -> &Streamer {
        &self.inner.streamer
    }

    pub fn reconciler(&self) -> &DesiredLrpReconciler {
        &self.inner.reconciler
    }
}
