//! Ordinary actual LRP transitions.
//!
//! ```text
//! Unclaimed --claim--> Claimed --start--> Running
//! Claimed/Running --crash--> Crashed --restart--> Unclaimed
//! Unclaimed --fail--> Unclaimed (placement error recorded)
//! any --remove/retire--> deleted
//! ```

use chrono::Utc;
use lrp_events::{
    ActualLrp, ActualLrpFilter, ActualLrpGroup, ActualLrpInstanceKey, ActualLrpKey,
    ActualLrpNetInfo, ActualLrpState, Event, Presence,
};
use lrp_id::ProcessGuid;
use tracing::{info, instrument, warn};

use super::ActualLrpController;
use crate::error::LrpError;

/// Longest crash reason kept on a record.
const MAX_CRASH_REASON_CHARS: usize = 1024;

impl ActualLrpController {
    /// Creates an Unclaimed record for a slot.
    #[instrument(skip_all, fields(lrp = %key))]
    pub async fn create_unclaimed(&self, key: ActualLrpKey) -> Result<ActualLrp, LrpError> {
        let lrp = ActualLrp::unclaimed(key, Utc::now());
        self.store
            .create_actual_lrp(Presence::Ordinary, &lrp)
            .await
            .map_err(|e| self.store_error(e))?;
        self.emitter.emit(Event::ActualLrpCreated {
            actual_lrp_group: ActualLrpGroup::ordinary(lrp.clone()),
        });
        Ok(lrp)
    }

    /// Claims an Unclaimed slot for an instance.
    ///
    /// Re-claiming by the current owner succeeds without a write.
    #[instrument(skip_all, fields(lrp = %key, cell = %instance_key.cell_id))]
    pub async fn claim(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<ActualLrp, LrpError> {
        let before = self.ordinary(key).await?;
        match before.state {
            ActualLrpState::Unclaimed => {}
            ActualLrpState::Claimed if before.is_owned_by(instance_key) => return Ok(before),
            ActualLrpState::Claimed => return Err(LrpError::InstanceMismatch(key.clone())),
            from => {
                return Err(LrpError::CannotTransition {
                    key: key.clone(),
                    from,
                    to: ActualLrpState::Claimed,
                })
            }
        }

        let mut after = before.clone();
        after.state = ActualLrpState::Claimed;
        after.instance_key = Some(instance_key.clone());
        after.placement_error = None;
        after.since = Utc::now();
        self.write(Presence::Ordinary, &before, &mut after).await?;
        self.emit_changed(Presence::Ordinary, before, after.clone());
        Ok(after)
    }

    /// Marks an instance Running.
    ///
    /// An identical retransmission is a no-op. A confirmed start clears any
    /// evacuating record left for the slot.
    #[instrument(skip_all, fields(lrp = %key, cell = %instance_key.cell_id))]
    pub async fn start(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
        net_info: ActualLrpNetInfo,
    ) -> Result<ActualLrp, LrpError> {
        let group = self.group(key).await?;
        let before = group
            .instance
            .clone()
            .ok_or_else(|| LrpError::NotFound(format!("actual lrp {key}")))?;

        let update = match before.state {
            ActualLrpState::Running if before.is_owned_by(instance_key) => {
                (before.net_info != net_info).then(|| {
                    let mut after = before.clone();
                    after.net_info = net_info;
                    after
                })
            }
            ActualLrpState::Running => {
                warn!("Start from a different instance than the one running");
                return Err(LrpError::InstanceMismatch(key.clone()));
            }
            ActualLrpState::Claimed => {
                let mut after = before.clone();
                after.state = ActualLrpState::Running;
                after.instance_key = Some(instance_key.clone());
                after.net_info = net_info;
                after.placement_error = None;
                after.since = Utc::now();
                Some(after)
            }
            from => {
                return Err(LrpError::CannotTransition {
                    key: key.clone(),
                    from,
                    to: ActualLrpState::Running,
                })
            }
        };

        let current = match update {
            Some(mut after) => {
                self.write(Presence::Ordinary, &before, &mut after).await?;
                self.emit_changed(Presence::Ordinary, before, after.clone());
                after
            }
            None => before,
        };

        if let Some(evacuating) = group.evacuating {
            if let Err(err) = self
                .remove_record(Presence::Evacuating, key, evacuating.instance_key.as_ref())
                .await
            {
                warn!(error = %err, "Failed to remove evacuating record after start");
            }
        }

        Ok(current)
    }

    /// Records a crash of the owning instance.
    ///
    /// Emits exactly one crashed event. When the restart policy allows an
    /// immediate restart the record is written back as Unclaimed and
    /// placement is requested.
    #[instrument(skip_all, fields(lrp = %key, cell = %instance_key.cell_id))]
    pub async fn crash(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
        reason: &str,
    ) -> Result<ActualLrp, LrpError> {
        let before = self.ordinary(key).await?;
        match before.state {
            ActualLrpState::Claimed | ActualLrpState::Running
                if before.is_owned_by(instance_key) => {}
            ActualLrpState::Claimed | ActualLrpState::Running => {
                return Err(LrpError::InstanceMismatch(key.clone()))
            }
            from => {
                return Err(LrpError::CannotTransition {
                    key: key.clone(),
                    from,
                    to: ActualLrpState::Crashed,
                })
            }
        }

        let now = Utc::now();
        let in_state_for = (now - before.since).to_std().unwrap_or_default();
        let crash_count = self.restart_policy.next_crash_count(
            before.crash_count,
            before.state == ActualLrpState::Running,
            in_state_for,
        );
        let crash_reason: String = reason.chars().take(MAX_CRASH_REASON_CHARS).collect();
        let restart = self.restart_policy.should_restart_immediately(crash_count);

        let mut after = before.clone();
        after.vacate(ActualLrpState::Crashed, now);
        after.crash_count = crash_count;
        after.crash_reason = Some(crash_reason.clone());
        if restart {
            after.state = ActualLrpState::Unclaimed;
        }
        self.write(Presence::Ordinary, &before, &mut after).await?;

        info!(crash_count, restart, reason = %crash_reason, "Actual LRP crashed");
        self.emitter.emit(Event::ActualLrpCrashed {
            key: key.clone(),
            instance_key: instance_key.clone(),
            crash_count,
            crash_reason,
            before: ActualLrpGroup::ordinary(before),
            after: ActualLrpGroup::ordinary(after.clone()),
        });

        if restart {
            self.request_placement_for(key).await;
        }
        Ok(after)
    }

    /// Records a placement failure on an Unclaimed slot.
    #[instrument(skip_all, fields(lrp = %key))]
    pub async fn fail(&self, key: &ActualLrpKey, reason: &str) -> Result<ActualLrp, LrpError> {
        let before = self.ordinary(key).await?;
        if before.state != ActualLrpState::Unclaimed {
            return Err(LrpError::CannotTransition {
                key: key.clone(),
                from: before.state,
                to: ActualLrpState::Unclaimed,
            });
        }

        let mut after = before.clone();
        after.placement_error = Some(reason.to_string());
        self.write(Presence::Ordinary, &before, &mut after).await?;
        self.emit_changed(Presence::Ordinary, before, after.clone());
        Ok(after)
    }

    /// Deletes the ordinary record, conditional on its owner if given.
    #[instrument(skip_all, fields(lrp = %key))]
    pub async fn remove(
        &self,
        key: &ActualLrpKey,
        instance_key: Option<&ActualLrpInstanceKey>,
    ) -> Result<ActualLrp, LrpError> {
        self.remove_record(Presence::Ordinary, key, instance_key)
            .await
    }

    /// Stops a placed instance if there is one, then deletes the record.
    ///
    /// Stop failures are logged; the record is removed regardless, as long
    /// as it is still owned by the instance observed here.
    #[instrument(skip_all, fields(lrp = %key))]
    pub async fn retire(&self, key: &ActualLrpKey) -> Result<ActualLrp, LrpError> {
        let lrp = self.ordinary(key).await?;
        if lrp.state.is_placed() {
            if let Some(instance_key) = &lrp.instance_key {
                if let Err(err) = self.stop_instance(key, instance_key).await {
                    warn!(
                        cell = %instance_key.cell_id,
                        error = %err,
                        "Failed to stop instance while retiring"
                    );
                }
            }
        }
        self.remove_record(Presence::Ordinary, key, lrp.instance_key.as_ref())
            .await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn actual_lrp_groups(
        &self,
        filter: &ActualLrpFilter,
    ) -> Result<Vec<ActualLrpGroup>, LrpError> {
        self.store
            .actual_lrp_groups(filter)
            .await
            .map_err(|e| self.store_error(e))
    }

    pub async fn actual_lrp_group_by_process_guid_and_index(
        &self,
        process_guid: &ProcessGuid,
        index: u32,
    ) -> Result<ActualLrpGroup, LrpError> {
        self.store
            .actual_lrp_group(process_guid, index)
            .await
            .map_err(|e| self.store_error(e))
    }

    /// Moves an ordinary record back to Unclaimed, clearing its instance.
    pub(crate) async fn unclaim(&self, before: &ActualLrp) -> Result<ActualLrp, LrpError> {
        let mut after = before.clone();
        after.vacate(ActualLrpState::Unclaimed, Utc::now());
        self.write(Presence::Ordinary, before, &mut after).await?;
        self.emit_changed(Presence::Ordinary, before.clone(), after.clone());
        Ok(after)
    }
}
