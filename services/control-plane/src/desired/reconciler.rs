//! Desired-to-actual reconciliation.
//!
//! Each desired LRP change is persisted first, then the slot delta is
//! applied through a bounded work pool:
//! - growth creates Unclaimed slots for the new high indices and asks for
//!   placement of all of them in one batch
//! - shrink selects every slot at or above the new count, highest first;
//!   unplaced slots are removed, placed ones are stopped on their cell
//!
//! Per-index failures are logged and reported in the outcome; they never
//! block the other indices. Re-running an operation after a partial
//! failure is safe.

use std::ops::Range;

use lrp_events::{
    ActualLrp, ActualLrpFilter, ActualLrpKey, ActualLrpState, DesiredLrpFilter,
    DesiredLrpSchedulingInfo, DesiredLrpUpdate, Event, ModificationTag,
};
use lrp_id::ProcessGuid;
use lrp_reconcile::{growth_range, select_for_stop, WorkPool};
use tracing::{debug, info, instrument, warn};

use crate::actual::ActualLrpController;
use crate::collaborators::{LrpStartRequest, PlacementBatch};
use crate::error::LrpError;

/// Indices touched by one reconciliation, each list ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// New Unclaimed slots, all of which were sent for placement.
    pub created: Vec<u32>,
    /// Unplaced slots deleted directly.
    pub removed: Vec<u32>,
    /// Placed slots whose cell was asked to stop them.
    pub stopped: Vec<u32>,
    pub failed: Vec<u32>,
}

impl ReconcileOutcome {
    fn record(&mut self, result: SlotResult) {
        match result {
            SlotResult::Created(i) => self.created.push(i),
            SlotResult::Removed(i) => self.removed.push(i),
            SlotResult::Stopped(i) => self.stopped.push(i),
            SlotResult::Failed(i) => self.failed.push(i),
            SlotResult::Skipped => {}
        }
    }

    fn sorted(mut self) -> Self {
        self.created.sort_unstable();
        self.removed.sort_unstable();
        self.stopped.sort_unstable();
        self.failed.sort_unstable();
        self
    }
}

enum SlotResult {
    Created(u32),
    Removed(u32),
    Stopped(u32),
    Failed(u32),
    Skipped,
}

/// Applies desired LRP changes and reconciles their slots.
#[derive(Clone)]
pub struct DesiredLrpReconciler {
    controller: ActualLrpController,
    update_workers: usize,
}

impl DesiredLrpReconciler {
    /// `update_workers` bounds the per-call slot fan-out. Zero is rejected
    /// when an operation runs.
    pub fn new(controller: ActualLrpController, update_workers: usize) -> Self {
        Self {
            controller,
            update_workers,
        }
    }

    pub fn controller(&self) -> &ActualLrpController {
        &self.controller
    }

    /// Persists a new desired LRP and creates its slots.
    #[instrument(skip_all, fields(process_guid = %desired.process_guid, instances = desired.instances))]
    pub async fn on_desire(
        &self,
        mut desired: DesiredLrpSchedulingInfo,
    ) -> Result<ReconcileOutcome, LrpError> {
        desired.validate()?;
        let pool = WorkPool::new(self.update_workers)?;

        desired.modification_tag = ModificationTag::new();
        self.controller
            .store()
            .create_desired_lrp(&desired)
            .await
            .map_err(|e| self.controller.store_error(e))?;
        info!("Desired LRP created");
        self.controller.emitter().emit(Event::DesiredLrpCreated {
            desired_lrp: desired.clone(),
        });

        let outcome = self.create_slots(&pool, &desired, 0..desired.instances).await;
        Ok(outcome)
    }

    /// Applies an update and scales the slots to the new instance count.
    #[instrument(skip_all, fields(process_guid = %process_guid))]
    pub async fn on_update(
        &self,
        process_guid: &ProcessGuid,
        update: DesiredLrpUpdate,
    ) -> Result<ReconcileOutcome, LrpError> {
        update.validate()?;
        let pool = WorkPool::new(self.update_workers)?;

        let before = self.desired_lrp_by_process_guid(process_guid).await?;
        let mut after = before.clone();
        if !after.apply(&update) {
            debug!("Update changes nothing");
            return Ok(ReconcileOutcome::default());
        }
        after.modification_tag = before.modification_tag.next();
        self.controller
            .store()
            .update_desired_lrp(&before.modification_tag, &after)
            .await
            .map_err(|e| self.controller.store_error(e))?;
        info!(
            from = before.instances,
            to = after.instances,
            "Desired LRP updated"
        );
        self.controller.emitter().emit(Event::DesiredLrpChanged {
            before: before.clone(),
            after: after.clone(),
        });

        if after.instances > before.instances {
            let range = growth_range(before.instances, after.instances);
            return Ok(self.create_slots(&pool, &after, range).await);
        }
        if after.instances < before.instances {
            let slots = self.ordinary_slots(process_guid).await?;
            let selected = select_for_stop(slots, after.instances, |lrp| lrp.key.index);
            return Ok(self.stop_slots(&pool, selected).await);
        }
        Ok(ReconcileOutcome::default())
    }

    /// Removes a desired LRP and stops or removes every one of its slots.
    #[instrument(skip_all, fields(process_guid = %process_guid))]
    pub async fn on_remove(&self, process_guid: &ProcessGuid) -> Result<ReconcileOutcome, LrpError> {
        let pool = WorkPool::new(self.update_workers)?;

        let removed = self
            .controller
            .store()
            .remove_desired_lrp(process_guid)
            .await
            .map_err(|e| self.controller.store_error(e))?;
        info!("Desired LRP removed");
        self.controller.emitter().emit(Event::DesiredLrpRemoved {
            desired_lrp: removed,
        });

        let slots = self.ordinary_slots(process_guid).await?;
        let selected = select_for_stop(slots, 0, |lrp| lrp.key.index);
        Ok(self.stop_slots(&pool, selected).await)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn desired_lrps(
        &self,
        filter: &DesiredLrpFilter,
    ) -> Result<Vec<DesiredLrpSchedulingInfo>, LrpError> {
        self.controller
            .store()
            .desired_lrps(filter)
            .await
            .map_err(|e| self.controller.store_error(e))
    }

    pub async fn desired_lrp_by_process_guid(
        &self,
        process_guid: &ProcessGuid,
    ) -> Result<DesiredLrpSchedulingInfo, LrpError> {
        self.controller
            .store()
            .desired_lrp(process_guid)
            .await
            .map_err(|e| self.controller.store_error(e))
    }

    // =========================================================================
    // Slot fan-out
    // =========================================================================

    async fn create_slots(
        &self,
        pool: &WorkPool,
        desired: &DesiredLrpSchedulingInfo,
        indices: Range<u32>,
    ) -> ReconcileOutcome {
        let controller = &self.controller;
        let results = pool
            .run(indices, |index| {
                let key = ActualLrpKey::new(desired.process_guid.clone(), index, desired.domain.clone());
                async move {
                    match controller.create_unclaimed(key).await {
                        Ok(_) => SlotResult::Created(index),
                        Err(LrpError::ResourceExists(_)) => {
                            debug!(index, "Slot already exists");
                            SlotResult::Skipped
                        }
                        Err(err) => {
                            warn!(index, error = %err, "Failed to create slot");
                            SlotResult::Failed(index)
                        }
                    }
                }
            })
            .await;

        let mut outcome = ReconcileOutcome::default();
        results.into_iter().for_each(|r| outcome.record(r));
        let outcome = outcome.sorted();

        let batch = PlacementBatch::single(LrpStartRequest::new(desired, outcome.created.clone()));
        self.controller.dispatch(batch).await;
        outcome
    }

    async fn stop_slots(&self, pool: &WorkPool, slots: Vec<ActualLrp>) -> ReconcileOutcome {
        let controller = &self.controller;
        let results = pool
            .run(slots, |lrp| async move {
                let index = lrp.key.index;
                match (lrp.state, &lrp.instance_key) {
                    (ActualLrpState::Claimed | ActualLrpState::Running, Some(instance_key)) => {
                        match controller.stop_instance(&lrp.key, instance_key).await {
                            Ok(()) => SlotResult::Stopped(index),
                            Err(err) => {
                                warn!(index, cell = %instance_key.cell_id, error = %err, "Failed to stop instance");
                                SlotResult::Failed(index)
                            }
                        }
                    }
                    _ => match controller.remove(&lrp.key, None).await {
                        Ok(_) => SlotResult::Removed(index),
                        Err(err) if err.is_not_found() => SlotResult::Skipped,
                        Err(err) => {
                            warn!(index, error = %err, "Failed to remove slot");
                            SlotResult::Failed(index)
                        }
                    },
                }
            })
            .await;

        let mut outcome = ReconcileOutcome::default();
        results.into_iter().for_each(|r| outcome.record(r));
        outcome.sorted()
    }

    async fn ordinary_slots(&self, process_guid: &ProcessGuid) -> Result<Vec<ActualLrp>, LrpError> {
        let groups = self
            .controller
            .actual_lrp_groups(&ActualLrpFilter::for_process(process_guid.clone()))
            .await?;
        Ok(groups.into_iter().filter_map(|g| g.instance).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::test_support::{drain, Harness, PROCESS_GUID};
    use lrp_events::{ActualLrpInstanceKey, ActualLrpNetInfo};
    use lrp_id::Domain;

    fn pg() -> ProcessGuid {
        ProcessGuid::parse(PROCESS_GUID).unwrap()
    }

    async fn make_running(h: &Harness, index: u32) -> ActualLrpInstanceKey {
        let ik = h.instance_key("cell-a");
        h.controller.claim(&h.key(index), &ik).await.unwrap();
        h.controller
            .start(&h.key(index), &ik, ActualLrpNetInfo::new("10.0.0.1", vec![]))
            .await
            .unwrap();
        ik
    }

    #[tokio::test]
    async fn test_on_desire_creates_slots_and_one_batch() {
        let h = Harness::new();
        let mut desired_events = h.desired_events().await;
        let mut actual_events = h.actual_events().await;

        let outcome = h.reconciler.on_desire(h.desired(3)).await.unwrap();
        assert_eq!(outcome.created, vec![0, 1, 2]);
        assert!(outcome.failed.is_empty());

        for index in 0..3 {
            assert_eq!(
                h.ordinary(index).await.unwrap().state,
                ActualLrpState::Unclaimed
            );
        }
        assert_eq!(h.fakes.auctioneer.batch_indices(), vec![vec![0, 1, 2]]);

        let desired = drain(&mut desired_events).await;
        assert_eq!(desired.len(), 1);
        assert!(matches!(desired[0], Event::DesiredLrpCreated { .. }));
        let actual = drain(&mut actual_events).await;
        assert_eq!(actual.len(), 3);
        assert!(actual
            .iter()
            .all(|e| matches!(e, Event::ActualLrpCreated { .. })));
    }

    #[tokio::test]
    async fn test_on_desire_existing_is_conflict() {
        let h = Harness::new();
        h.reconciler.on_desire(h.desired(1)).await.unwrap();

        let err = h.reconciler.on_desire(h.desired(2)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(h.fakes.auctioneer.batches().len(), 1);
        assert!(h.group(1).await.is_none());
    }

    #[tokio::test]
    async fn test_on_desire_rejects_invalid_desired_lrp() {
        let h = Harness::new();
        let mut desired = h.desired(2);
        desired.placement.root_fs = String::new();

        let err = h.reconciler.on_desire(desired).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(h.reconciler.desired_lrp_by_process_guid(&pg()).await.is_err());
    }

    #[tokio::test]
    async fn test_on_desire_zero_instances_skips_placement() {
        let h = Harness::new();
        let outcome = h.reconciler.on_desire(h.desired(0)).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::default());
        assert!(h.fakes.auctioneer.batches().is_empty());
    }

    #[tokio::test]
    async fn test_on_desire_skips_existing_slots() {
        let h = Harness::new();
        h.controller.create_unclaimed(h.key(1)).await.unwrap();

        let outcome = h.reconciler.on_desire(h.desired(3)).await.unwrap();
        assert_eq!(outcome.created, vec![0, 2]);
        assert!(outcome.failed.is_empty());
        assert_eq!(h.fakes.auctioneer.batch_indices(), vec![vec![0, 2]]);
    }

    #[tokio::test]
    async fn test_zero_workers_rejected() {
        let h = Harness::new();
        let reconciler = DesiredLrpReconciler::new(h.controller.clone(), 0);
        let err = reconciler.on_desire(h.desired(1)).await.unwrap_err();
        assert!(matches!(err, LrpError::Config(_)));
        assert!(reconciler.desired_lrps(&DesiredLrpFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scale_up_requests_new_indices_only() {
        let h = Harness::new();
        h.reconciler.on_desire(h.desired(1)).await.unwrap();

        let outcome = h
            .reconciler
            .on_update(&pg(), DesiredLrpUpdate::instances(5))
            .await
            .unwrap();
        assert_eq!(outcome.created, vec![1, 2, 3, 4]);
        assert_eq!(
            h.fakes.auctioneer.batch_indices(),
            vec![vec![0], vec![1, 2, 3, 4]]
        );
        assert_eq!(
            h.reconciler
                .desired_lrp_by_process_guid(&pg())
                .await
                .unwrap()
                .instances,
            5
        );
    }

    #[tokio::test]
    async fn test_scale_down_stops_highest_indices() {
        let h = Harness::new();
        h.reconciler.on_desire(h.desired(5)).await.unwrap();
        for index in 0..5 {
            make_running(&h, index).await;
        }

        let outcome = h
            .reconciler
            .on_update(&pg(), DesiredLrpUpdate::instances(3))
            .await
            .unwrap();
        assert_eq!(outcome.stopped, vec![3, 4]);
        assert!(outcome.removed.is_empty());

        let mut stopped = h.fakes.cells.stopped_indices();
        stopped.sort_unstable();
        assert_eq!(stopped, vec![3, 4]);
        assert!(h
            .fakes
            .cells
            .stops()
            .iter()
            .all(|s| s.address == "http://cell-a:1800"));
        // Records go away when the cell reports the stop.
        assert!(h.ordinary(4).await.is_some());
    }

    #[tokio::test]
    async fn test_scale_down_removes_unplaced_slots() {
        let h = Harness::new();
        h.reconciler.on_desire(h.desired(4)).await.unwrap();
        make_running(&h, 2).await;

        let outcome = h
            .reconciler
            .on_update(&pg(), DesiredLrpUpdate::instances(1))
            .await
            .unwrap();
        assert_eq!(outcome.removed, vec![1, 3]);
        assert_eq!(outcome.stopped, vec![2]);
        assert!(h.ordinary(1).await.is_none());
        assert!(h.ordinary(3).await.is_none());
        assert!(h.ordinary(0).await.is_some());
    }

    #[tokio::test]
    async fn test_stop_failure_does_not_block_others() {
        let h = Harness::new();
        h.reconciler.on_desire(h.desired(3)).await.unwrap();
        make_running(&h, 2).await;
        h.fakes.cells.set_failing(true);

        let outcome = h
            .reconciler
            .on_update(&pg(), DesiredLrpUpdate::instances(0))
            .await
            .unwrap();
        assert_eq!(outcome.failed, vec![2]);
        assert_eq!(outcome.removed, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_annotation_update_emits_change_only() {
        let h = Harness::new();
        h.reconciler.on_desire(h.desired(2)).await.unwrap();
        let mut events = h.desired_events().await;

        let update = DesiredLrpUpdate {
            instances: None,
            annotation: Some("build 42".to_string()),
        };
        let outcome = h.reconciler.on_update(&pg(), update.clone()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::default());

        let events = drain(&mut events).await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::DesiredLrpChanged { before, after } => {
                assert_eq!(after.annotation.as_deref(), Some("build 42"));
                assert_eq!(after.modification_tag.index, before.modification_tag.index + 1);
            }
            other => panic!("unexpected event {other:?}"),
        }

        // Same update again is a no-op.
        let mut events = h.desired_events().await;
        h.reconciler.on_update(&pg(), update).await.unwrap();
        assert!(drain(&mut events).await.is_empty());
        assert_eq!(h.fakes.auctioneer.batches().len(), 1);
    }

    #[tokio::test]
    async fn test_update_errors() {
        let h = Harness::new();
        let err = h
            .reconciler
            .on_update(&pg(), DesiredLrpUpdate::instances(2))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let err = h
            .reconciler
            .on_update(&pg(), DesiredLrpUpdate::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_on_remove_retires_every_slot() {
        let h = Harness::new();
        h.reconciler.on_desire(h.desired(3)).await.unwrap();
        make_running(&h, 0).await;
        let mut events = h.desired_events().await;

        let outcome = h.reconciler.on_remove(&pg()).await.unwrap();
        assert_eq!(outcome.removed, vec![1, 2]);
        assert_eq!(outcome.stopped, vec![0]);
        assert_eq!(h.fakes.cells.stopped_indices(), vec![0]);

        let events = drain(&mut events).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Event::DesiredLrpRemoved { .. }));
        assert!(h.reconciler.desired_lrp_by_process_guid(&pg()).await.unwrap_err().is_not_found());

        let err = h.reconciler.on_remove(&pg()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_desired_reads_filter_by_domain() {
        let h = Harness::new();
        h.reconciler.on_desire(h.desired(0)).await.unwrap();
        let mut other = h.desired(0);
        other.process_guid = ProcessGuid::parse("worker").unwrap();
        other.domain = Domain::parse("tasks").unwrap();
        h.reconciler.on_desire(other).await.unwrap();

        let all = h
            .reconciler
            .desired_lrps(&DesiredLrpFilter::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let filter = DesiredLrpFilter {
            domain: Some(Domain::parse("tasks").unwrap()),
        };
        let tasks = h.reconciler.desired_lrps(&filter).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].process_guid.as_str(), "worker");
    }
}
