//! LRP convergence.
//!
//! One pass compares every desired LRP with its actual slots and repairs
//! the difference:
//! - stale Unclaimed slots are sent for placement again
//! - missing indices get a new Unclaimed slot
//! - indices at or above the desired count are retired
//! - slots with no desired LRP are retired
//! - Crashed slots due for a restart go back to Unclaimed
//!
//! Every slot that needs placement goes out in a single batch at the end.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lrp_events::{
    ActualLrp, ActualLrpFilter, ActualLrpKey, ActualLrpState, DesiredLrpFilter,
    DesiredLrpSchedulingInfo, Presence,
};
use lrp_id::ProcessGuid;
use tracing::{debug, info, instrument, warn};

use super::ActualLrpController;
use crate::error::{ErrorKind, LrpError};

/// How long a slot may sit Unclaimed before placement is requested again.
pub const STALE_UNCLAIMED_AFTER: Duration = Duration::from_secs(30);

/// Counters from one convergence pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConvergenceStats {
    pub crashed_examined: usize,
    pub restarted: usize,
    pub stale_unclaimed: usize,
    /// Unclaimed slots created for indices that had no record.
    pub missing_created: usize,
    /// Slots at or above the desired instance count.
    pub extra_retired: usize,
    /// Slots whose desired LRP no longer exists.
    pub orphans_retired: usize,
    pub failed: usize,
}

impl ConvergenceStats {
    pub fn changed_anything(&self) -> bool {
        self.restarted > 0
            || self.stale_unclaimed > 0
            || self.missing_created > 0
            || self.extra_retired > 0
            || self.orphans_retired > 0
            || self.failed > 0
    }
}

/// Indices to place, per process guid.
type Starts = BTreeMap<ProcessGuid, BTreeSet<u32>>;

impl ActualLrpController {
    /// Runs every convergence step and requests placement for all the
    /// slots they produced in one batch.
    ///
    /// Per-slot failures are counted and retried on the next pass. An
    /// unrecoverable storage error aborts the pass.
    #[instrument(skip_all)]
    pub async fn converge_lrps(&self, now: DateTime<Utc>) -> Result<ConvergenceStats, LrpError> {
        let desired: BTreeMap<ProcessGuid, DesiredLrpSchedulingInfo> = self
            .store
            .desired_lrps(&DesiredLrpFilter::default())
            .await
            .map_err(|e| self.store_error(e))?
            .into_iter()
            .map(|d| (d.process_guid.clone(), d))
            .collect();
        let slots = self.ordinary_records().await?;

        let mut stats = ConvergenceStats::default();
        let mut starts = Starts::new();

        self.stale_unclaimed(&desired, &slots, now, &mut stats, &mut starts);
        self.missing_indices(&desired, &slots, &mut stats, &mut starts)
            .await?;
        self.retire_surplus(&desired, &slots, &mut stats).await?;
        let wanted = slots
            .into_iter()
            .filter(|lrp| is_wanted(&desired, &lrp.key))
            .collect();
        self.restart_crashed(wanted, now, &mut stats, &mut starts)
            .await?;

        self.place(starts).await;
        debug!(?stats, "Convergence pass complete");
        Ok(stats)
    }

    /// Moves every Crashed record that is due for a restart back to
    /// Unclaimed and requests placement for all of them in one batch.
    ///
    /// Conflicting writes are counted as failures and picked up on the
    /// next pass. An unrecoverable storage error aborts the pass.
    #[instrument(skip_all)]
    pub async fn converge_crashed(&self, now: DateTime<Utc>) -> Result<ConvergenceStats, LrpError> {
        let slots = self.ordinary_records().await?;

        let mut stats = ConvergenceStats::default();
        let mut starts = Starts::new();
        self.restart_crashed(slots, now, &mut stats, &mut starts)
            .await?;

        self.place(starts).await;
        debug!(
            examined = stats.crashed_examined,
            restarted = stats.restarted,
            failed = stats.failed,
            "Crash convergence pass complete"
        );
        Ok(stats)
    }

    async fn ordinary_records(&self) -> Result<Vec<ActualLrp>, LrpError> {
        let groups = self.actual_lrp_groups(&ActualLrpFilter::default()).await?;
        Ok(groups.into_iter().filter_map(|g| g.instance).collect())
    }

    async fn place(&self, starts: Starts) {
        if starts.is_empty() {
            return;
        }
        let starts = starts
            .into_iter()
            .map(|(guid, indices)| (guid, indices.into_iter().collect()))
            .collect();
        self.request_placement(starts).await;
    }

    fn stale_unclaimed(
        &self,
        desired: &BTreeMap<ProcessGuid, DesiredLrpSchedulingInfo>,
        slots: &[ActualLrp],
        now: DateTime<Utc>,
        stats: &mut ConvergenceStats,
        starts: &mut Starts,
    ) {
        for lrp in slots {
            if lrp.state != ActualLrpState::Unclaimed || !is_wanted(desired, &lrp.key) {
                continue;
            }
            let waited = (now - lrp.since).to_std().unwrap_or_default();
            if waited < STALE_UNCLAIMED_AFTER {
                continue;
            }
            info!(lrp = %lrp.key, "Requesting placement for stale unclaimed slot");
            stats.stale_unclaimed += 1;
            starts
                .entry(lrp.key.process_guid.clone())
                .or_default()
                .insert(lrp.key.index);
        }
    }

    async fn missing_indices(
        &self,
        desired: &BTreeMap<ProcessGuid, DesiredLrpSchedulingInfo>,
        slots: &[ActualLrp],
        stats: &mut ConvergenceStats,
        starts: &mut Starts,
    ) -> Result<(), LrpError> {
        let existing: BTreeSet<(&ProcessGuid, u32)> = slots
            .iter()
            .map(|lrp| (&lrp.key.process_guid, lrp.key.index))
            .collect();

        for (guid, lrp) in desired {
            for index in 0..lrp.instances {
                if existing.contains(&(guid, index)) {
                    continue;
                }
                let key = ActualLrpKey::new(guid.clone(), index, lrp.domain.clone());
                match self.create_unclaimed(key).await {
                    Ok(created) => {
                        info!(lrp = %created.key, "Created missing slot");
                        stats.missing_created += 1;
                        starts.entry(guid.clone()).or_default().insert(index);
                    }
                    Err(err) if err.kind() == ErrorKind::Unrecoverable => return Err(err),
                    Err(LrpError::ResourceExists(_)) => {}
                    Err(err) => {
                        stats.failed += 1;
                        warn!(process_guid = %guid, index, error = %err, "Failed to create missing slot");
                    }
                }
            }
        }
        Ok(())
    }

    /// Retires slots above the desired count and slots with no desired LRP.
    async fn retire_surplus(
        &self,
        desired: &BTreeMap<ProcessGuid, DesiredLrpSchedulingInfo>,
        slots: &[ActualLrp],
        stats: &mut ConvergenceStats,
    ) -> Result<(), LrpError> {
        for lrp in slots {
            let orphan = match desired.get(&lrp.key.process_guid) {
                None => true,
                Some(d) if lrp.key.index >= d.instances => false,
                Some(_) => continue,
            };
            match self.retire(&lrp.key).await {
                Ok(_) if orphan => {
                    info!(lrp = %lrp.key, "Retired orphaned slot");
                    stats.orphans_retired += 1;
                }
                Ok(_) => {
                    info!(lrp = %lrp.key, "Retired extra slot");
                    stats.extra_retired += 1;
                }
                Err(err) if err.kind() == ErrorKind::Unrecoverable => return Err(err),
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    stats.failed += 1;
                    warn!(lrp = %lrp.key, error = %err, "Failed to retire slot");
                }
            }
        }
        Ok(())
    }

    async fn restart_crashed(
        &self,
        slots: Vec<ActualLrp>,
        now: DateTime<Utc>,
        stats: &mut ConvergenceStats,
        starts: &mut Starts,
    ) -> Result<(), LrpError> {
        for before in slots {
            if before.state != ActualLrpState::Crashed {
                continue;
            }
            stats.crashed_examined += 1;

            let elapsed = (now - before.since).to_std().unwrap_or_default();
            if !self
                .restart_policy
                .should_restart(before.crash_count, elapsed)
            {
                continue;
            }

            let mut after = before.clone();
            after.vacate(ActualLrpState::Unclaimed, now);
            match self.write(Presence::Ordinary, &before, &mut after).await {
                Ok(()) => {
                    stats.restarted += 1;
                    starts
                        .entry(after.key.process_guid.clone())
                        .or_default()
                        .insert(after.key.index);
                    self.emit_changed(Presence::Ordinary, before, after);
                }
                Err(err) if err.kind() == ErrorKind::Unrecoverable => return Err(err),
                Err(err) => {
                    stats.failed += 1;
                    warn!(lrp = %before.key, error = %err, "Failed to restart crashed instance");
                }
            }
        }
        Ok(())
    }
}

/// Whether the slot is within its desired LRP's instance count.
fn is_wanted(desired: &BTreeMap<ProcessGuid, DesiredLrpSchedulingInfo>, key: &ActualLrpKey) -> bool {
    desired
        .get(&key.process_guid)
        .is_some_and(|d| key.index < d.instances)
}
