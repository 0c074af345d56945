//! Actual LRP lifecycle, evacuation and convergence.
//!
//! Every mutation follows the same shape: read the record, check the
//! transition, write conditionally on the tag that was read, then emit one
//! event. A lost race surfaces as a conflict and is never retried here.

mod convergence;
mod evacuation;
mod lifecycle;
mod worker;

pub use convergence::{ConvergenceStats, STALE_UNCLAIMED_AFTER};
pub use evacuation::KeepContainer;
pub use worker::ConvergenceWorker;

use std::collections::BTreeMap;
use std::sync::Arc;

use lrp_events::{
    ActualLrp, ActualLrpGroup, ActualLrpInstanceKey, ActualLrpKey, Event, Presence,
};
use lrp_id::ProcessGuid;
use lrp_reconcile::{BackoffRestartPolicy, RestartPolicy};
use tracing::{debug, error, warn};

use crate::collaborators::{CollaboratorError, Collaborators, LrpStartRequest, PlacementBatch};
use crate::emitter::EventEmitter;
use crate::error::LrpError;
use crate::storage::{Storage, StoreError};

/// Drives actual LRP records through their lifecycle.
#[derive(Clone)]
pub struct ActualLrpController {
    store: Arc<dyn Storage>,
    emitter: EventEmitter,
    collaborators: Collaborators,
    restart_policy: Arc<dyn RestartPolicy>,
}

impl ActualLrpController {
    pub fn new(store: Arc<dyn Storage>, emitter: EventEmitter, collaborators: Collaborators) -> Self {
        Self {
            store,
            emitter,
            collaborators,
            restart_policy: Arc::new(BackoffRestartPolicy::default()),
        }
    }

    pub fn with_restart_policy(mut self, policy: Arc<dyn RestartPolicy>) -> Self {
        self.restart_policy = policy;
        self
    }

    pub(crate) fn store(&self) -> &Arc<dyn Storage> {
        &self.store
    }

    pub(crate) fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }

    /// Converts a storage error, raising shutdown if it is unrecoverable.
    pub(crate) fn store_error(&self, err: StoreError) -> LrpError {
        if err.is_unrecoverable() {
            error!(error = %err, "Unrecoverable storage error");
            self.collaborators.shutdown.notify();
        }
        err.into()
    }

    async fn group(&self, key: &ActualLrpKey) -> Result<ActualLrpGroup, LrpError> {
        self.store
            .actual_lrp_group(&key.process_guid, key.index)
            .await
            .map_err(|e| self.store_error(e))
    }

    async fn ordinary(&self, key: &ActualLrpKey) -> Result<ActualLrp, LrpError> {
        self.group(key)
            .await?
            .instance
            .ok_or_else(|| LrpError::NotFound(format!("actual lrp {key}")))
    }

    /// Writes `after` over `before`, conditional on `before`'s tag.
    async fn write(
        &self,
        presence: Presence,
        before: &ActualLrp,
        after: &mut ActualLrp,
    ) -> Result<(), LrpError> {
        after.modification_tag = before.modification_tag.next();
        self.store
            .update_actual_lrp(presence, &before.modification_tag, after)
            .await
            .map_err(|e| self.store_error(e))
    }

    /// Removes a record, conditional on its owner when one is given.
    async fn remove_record(
        &self,
        presence: Presence,
        key: &ActualLrpKey,
        instance_key: Option<&ActualLrpInstanceKey>,
    ) -> Result<ActualLrp, LrpError> {
        let removed = self
            .store
            .remove_actual_lrp(presence, key, instance_key)
            .await
            .map_err(|e| match e {
                StoreError::Conflict(_) => LrpError::InstanceMismatch(key.clone()),
                other => self.store_error(other),
            })?;
        self.emitter.emit(Event::ActualLrpRemoved {
            actual_lrp_group: group_of(presence, removed.clone()),
        });
        Ok(removed)
    }

    fn emit_changed(&self, presence: Presence, before: ActualLrp, after: ActualLrp) {
        self.emitter.emit(Event::ActualLrpChanged {
            before: group_of(presence, before),
            after: group_of(presence, after),
        });
    }

    /// Requests placement for the given indices, one batch in total.
    ///
    /// Process guids whose desired LRP cannot be read are skipped.
    pub(crate) async fn request_placement(&self, starts: BTreeMap<ProcessGuid, Vec<u32>>) {
        let mut batch = PlacementBatch::default();
        for (process_guid, indices) in starts {
            match self.store.desired_lrp(&process_guid).await {
                Ok(desired) => batch.push(LrpStartRequest::new(&desired, indices)),
                Err(err) => {
                    let err = self.store_error(err);
                    warn!(
                        process_guid = %process_guid,
                        error = %err,
                        "Skipping placement; desired lrp unavailable"
                    );
                }
            }
        }
        self.dispatch(batch).await;
    }

    pub(crate) async fn request_placement_for(&self, key: &ActualLrpKey) {
        let starts = BTreeMap::from([(key.process_guid.clone(), vec![key.index])]);
        self.request_placement(starts).await;
    }

    /// Sends a batch to the auctioneer. Empty batches are skipped and
    /// failures are only logged.
    pub(crate) async fn dispatch(&self, batch: PlacementBatch) {
        if batch.is_empty() {
            return;
        }
        let instances = batch.instance_count();
        match self.collaborators.auctioneer.request_placement(batch).await {
            Ok(()) => debug!(instances, "Placement requested"),
            Err(err) => error!(error = %err, instances, "Failed to request placement"),
        }
    }

    /// Asks the owning cell to stop an instance.
    pub(crate) async fn stop_instance(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<(), CollaboratorError> {
        let address = self
            .collaborators
            .discovery
            .resolve(&instance_key.cell_id)
            .await?;
        self.collaborators
            .cells
            .stop_lrp_instance(&address, key, instance_key)
            .await
    }
}

fn group_of(presence: Presence, lrp: ActualLrp) -> ActualLrpGroup {
    match presence {
        Presence::Ordinary => ActualLrpGroup::ordinary(lrp),
        Presence::Evacuating => ActualLrpGroup::evacuating(lrp),
    }
}
