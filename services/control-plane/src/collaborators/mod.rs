//! External collaborators: placement, cell control, discovery and shutdown.
//!
//! Failures from these are logged by callers and never surfaced to API
//! clients. None of the calls carry internal timeouts.

mod discovery;
mod http;
mod shutdown;

pub use discovery::StaticServiceDiscovery;
pub use http::{HttpAuctionDispatcher, HttpCellClient};
pub use shutdown::WatchShutdown;

use std::sync::Arc;

use async_trait::async_trait;
use lrp_events::{
    ActualLrpInstanceKey, ActualLrpKey, DesiredLrpSchedulingInfo, PlacementConstraint, Resources,
};
use lrp_id::{CellId, Domain, ProcessGuid};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Collaborator call failures.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("cell {0} is not registered")]
    CellNotFound(CellId),

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{service} responded {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },

    /// Failure reported by a non-HTTP implementation.
    #[error("{0}")]
    Other(String),
}

// =============================================================================
// Placement
// =============================================================================

/// Start request for some indices of one desired LRP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LrpStartRequest {
    pub process_guid: ProcessGuid,
    pub domain: Domain,
    /// Ascending.
    pub indices: Vec<u32>,
    pub resources: Resources,
    pub placement: PlacementConstraint,
}

impl LrpStartRequest {
    pub fn new(desired: &DesiredLrpSchedulingInfo, mut indices: Vec<u32>) -> Self {
        indices.sort_unstable();
        indices.dedup();
        Self {
            process_guid: desired.process_guid.clone(),
            domain: desired.domain.clone(),
            indices,
            resources: desired.resources.clone(),
            placement: desired.placement.clone(),
        }
    }
}

/// One dispatch to the placement engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementBatch {
    pub starts: Vec<LrpStartRequest>,
}

impl PlacementBatch {
    pub fn single(start: LrpStartRequest) -> Self {
        Self {
            starts: vec![start],
        }
    }

    pub fn push(&mut self, start: LrpStartRequest) {
        if !start.indices.is_empty() {
            self.starts.push(start);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.starts.iter().all(|s| s.indices.is_empty())
    }

    pub fn instance_count(&self) -> usize {
        self.starts.iter().map(|s| s.indices.len()).sum()
    }
}

// =============================================================================
// Traits
// =============================================================================

/// Hands start requests to the placement engine.
#[async_trait]
pub trait AuctionDispatcher: Send + Sync {
    async fn request_placement(&self, batch: PlacementBatch) -> Result<(), CollaboratorError>;
}

/// Resolves a cell id to the address of its control endpoint.
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    async fn resolve(&self, cell_id: &CellId) -> Result<String, CollaboratorError>;
}

/// Talks to the agent running on a cell.
#[async_trait]
pub trait CellClient: Send + Sync {
    async fn stop_lrp_instance(
        &self,
        address: &str,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<(), CollaboratorError>;
}

/// One-shot, non-blocking request for process shutdown.
pub trait ShutdownNotifier: Send + Sync {
    fn notify(&self);
}

/// The collaborator set shared by the controllers.
#[derive(Clone)]
pub struct Collaborators {
    pub auctioneer: Arc<dyn AuctionDispatcher>,
    pub discovery: Arc<dyn ServiceDiscovery>,
    pub cells: Arc<dyn CellClient>,
    pub shutdown: Arc<dyn ShutdownNotifier>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use lrp_events::ModificationTag;

    #[test]
    fn test_start_request_sorts_indices() {
        let desired = DesiredLrpSchedulingInfo {
            process_guid: ProcessGuid::parse("web").unwrap(),
            domain: Domain::parse("cf-apps").unwrap(),
            instances: 5,
            resources: Resources {
                memory_mb: 128,
                disk_mb: 256,
                max_pids: 64,
            },
            placement: PlacementConstraint {
                root_fs: "preloaded:cflinuxfs4".to_string(),
                ..Default::default()
            },
            annotation: None,
            modification_tag: ModificationTag::new(),
        };
        let start = LrpStartRequest::new(&desired, vec![4, 1, 3, 1]);
        assert_eq!(start.indices, vec![1, 3, 4]);
        assert_eq!(start.resources.memory_mb, 128);

        let mut batch = PlacementBatch::default();
        assert!(batch.is_empty());
        batch.push(LrpStartRequest::new(&desired, vec![]));
        assert!(batch.starts.is_empty());
        batch.push(start);
        assert_eq!(batch.instance_count(), 3);
    }
}
