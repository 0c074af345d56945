//! Recording collaborator fakes for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use lrp_events::{ActualLrpInstanceKey, ActualLrpKey};
use lrp_id::CellId;

use crate::collaborators::{
    AuctionDispatcher, CellClient, CollaboratorError, Collaborators, PlacementBatch,
    ShutdownNotifier, StaticServiceDiscovery,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Records every placement batch.
#[derive(Debug, Default)]
pub struct RecordingAuctioneer {
    batches: Mutex<Vec<PlacementBatch>>,
    failing: AtomicBool,
}

impl RecordingAuctioneer {
    pub fn batches(&self) -> Vec<PlacementBatch> {
        lock(&self.batches).clone()
    }

    /// Indices of every recorded start, flattened per batch.
    pub fn batch_indices(&self) -> Vec<Vec<u32>> {
        lock(&self.batches)
            .iter()
            .map(|b| b.starts.iter().flat_map(|s| s.indices.clone()).collect())
            .collect()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl AuctionDispatcher for RecordingAuctioneer {
    async fn request_placement(&self, batch: PlacementBatch) -> Result<(), CollaboratorError> {
        lock(&self.batches).push(batch);
        if self.failing.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Other("auctioneer unavailable".to_string()));
        }
        Ok(())
    }
}

/// A recorded stop request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopCall {
    pub address: String,
    pub key: ActualLrpKey,
    pub instance_key: ActualLrpInstanceKey,
}

/// Records every stop request.
#[derive(Debug, Default)]
pub struct RecordingCellClient {
    stops: Mutex<Vec<StopCall>>,
    failing: AtomicBool,
}

impl RecordingCellClient {
    pub fn stops(&self) -> Vec<StopCall> {
        lock(&self.stops).clone()
    }

    pub fn stopped_indices(&self) -> Vec<u32> {
        lock(&self.stops).iter().map(|s| s.key.index).collect()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl CellClient for RecordingCellClient {
    async fn stop_lrp_instance(
        &self,
        address: &str,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<(), CollaboratorError> {
        lock(&self.stops).push(StopCall {
            address: address.to_string(),
            key: key.clone(),
            instance_key: instance_key.clone(),
        });
        if self.failing.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Other("cell unreachable".to_string()));
        }
        Ok(())
    }
}

/// Counts shutdown notifications.
#[derive(Debug, Default)]
pub struct RecordingShutdown {
    count: AtomicUsize,
}

impl RecordingShutdown {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl ShutdownNotifier for RecordingShutdown {
    fn notify(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

/// All fakes, with typed handles kept for assertions.
#[derive(Clone)]
pub struct FakeCollaborators {
    pub auctioneer: Arc<RecordingAuctioneer>,
    pub discovery: Arc<StaticServiceDiscovery>,
    pub cells: Arc<RecordingCellClient>,
    pub shutdown: Arc<RecordingShutdown>,
}

impl FakeCollaborators {
    /// Fakes whose discovery knows the given cells.
    pub fn with_cells<'a>(cells: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let table: HashMap<CellId, String> = cells
            .into_iter()
            .filter_map(|(id, addr)| CellId::parse(id).ok().map(|id| (id, addr.to_string())))
            .collect();
        Self {
            auctioneer: Arc::default(),
            discovery: Arc::new(StaticServiceDiscovery::new(table)),
            cells: Arc::default(),
            shutdown: Arc::default(),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            auctioneer: self.auctioneer.clone(),
            discovery: self.discovery.clone(),
            cells: self.cells.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl Default for FakeCollaborators {
    fn default() -> Self {
        Self::with_cells([])
    }
}
