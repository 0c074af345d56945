//! Evacuation: draining instances off a cell without losing capacity.
//!
//! While a cell drains, an instance it runs may be copied into the slot's
//! evacuating record so it keeps serving until a replacement starts
//! elsewhere. Every operation tells the draining cell whether to keep the
//! container. Callers must keep it when an error is returned.

use chrono::Utc;
use lrp_events::{
    ActualLrp, ActualLrpGroup, ActualLrpInstanceKey, ActualLrpKey, ActualLrpNetInfo,
    ActualLrpState, Event, Presence,
};
use tracing::{info, instrument};

use super::ActualLrpController;
use crate::error::LrpError;

/// Whether the draining cell should keep its container.
pub type KeepContainer = bool;

impl ActualLrpController {
    /// An instance was claimed but not yet running when its cell drained.
    #[instrument(skip_all, fields(lrp = %key, cell = %instance_key.cell_id))]
    pub async fn evacuate_claimed(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<KeepContainer, LrpError> {
        let Some(group) = self.group_if_exists(key).await? else {
            return Ok(false);
        };

        if owns_evacuating(&group, instance_key) {
            self.remove_record(Presence::Evacuating, key, Some(instance_key))
                .await?;
            return Ok(false);
        }

        if let Some(instance) = group.instance {
            if instance.state == ActualLrpState::Claimed && instance.is_owned_by(instance_key) {
                self.unclaim(&instance).await?;
                self.request_placement_for(key).await;
            }
        }
        Ok(false)
    }

    /// A running instance is on a draining cell.
    #[instrument(skip_all, fields(lrp = %key, cell = %instance_key.cell_id))]
    pub async fn evacuate_running(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
        net_info: ActualLrpNetInfo,
    ) -> Result<KeepContainer, LrpError> {
        let Some(group) = self.group_if_exists(key).await? else {
            return Ok(false);
        };

        // The desired LRP went away; only the evacuating record is left.
        let Some(instance) = group.instance.clone() else {
            self.remove_owned_evacuating(&group, key, instance_key)
                .await?;
            return Ok(false);
        };

        let owned = instance.is_owned_by(instance_key);
        match instance.state {
            ActualLrpState::Unclaimed if instance.placement_error.is_none() => {
                self.hold_evacuating(&group, key, instance_key, net_info)
                    .await
            }
            ActualLrpState::Claimed if !owned => {
                self.hold_evacuating(&group, key, instance_key, net_info)
                    .await
            }
            ActualLrpState::Running if !owned => {
                self.remove_owned_evacuating(&group, key, instance_key)
                    .await?;
                Ok(false)
            }
            ActualLrpState::Crashed => {
                self.remove_owned_evacuating(&group, key, instance_key)
                    .await?;
                Ok(false)
            }
            ActualLrpState::Claimed | ActualLrpState::Running => {
                self.upsert_evacuating(group.evacuating, key, instance_key, net_info)
                    .await?;
                self.unclaim(&instance).await?;
                self.request_placement_for(key).await;
                info!("Instance moved to evacuating; replacement requested");
                Ok(true)
            }
            ActualLrpState::Unclaimed => Ok(false),
        }
    }

    /// An instance on a draining cell crashed.
    #[instrument(skip_all, fields(lrp = %key, cell = %instance_key.cell_id))]
    pub async fn evacuate_crashed(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
        reason: &str,
    ) -> Result<KeepContainer, LrpError> {
        let Some(group) = self.group_if_exists(key).await? else {
            return Ok(false);
        };

        if owns_evacuating(&group, instance_key) {
            self.remove_record(Presence::Evacuating, key, Some(instance_key))
                .await?;
            return Ok(false);
        }

        match self.crash(key, instance_key, reason).await {
            Ok(_) => Ok(false),
            Err(
                LrpError::NotFound(_)
                | LrpError::CannotTransition { .. }
                | LrpError::InstanceMismatch(_),
            ) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// An instance on a draining cell stopped.
    #[instrument(skip_all, fields(lrp = %key, cell = %instance_key.cell_id))]
    pub async fn evacuate_stopped(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<KeepContainer, LrpError> {
        let group = self.group(key).await?;

        if owns_evacuating(&group, instance_key) {
            self.remove_record(Presence::Evacuating, key, Some(instance_key))
                .await?;
        } else {
            self.remove_record(Presence::Ordinary, key, Some(instance_key))
                .await?;
        }
        Ok(false)
    }

    /// Removes the evacuating record owned by `instance_key`.
    #[instrument(skip_all, fields(lrp = %key, cell = %instance_key.cell_id))]
    pub async fn remove_evacuating_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<(), LrpError> {
        let group = self.group(key).await?;
        if !owns_evacuating(&group, instance_key) {
            return Err(LrpError::NotFound(format!("evacuating actual lrp {key}")));
        }
        self.remove_record(Presence::Evacuating, key, Some(instance_key))
            .await?;
        Ok(())
    }

    async fn group_if_exists(&self, key: &ActualLrpKey) -> Result<Option<ActualLrpGroup>, LrpError> {
        match self.group(key).await {
            Ok(group) => Ok(Some(group)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Keeps serving from a cell that is not the slot's current owner,
    /// unless another cell already holds the evacuating record.
    async fn hold_evacuating(
        &self,
        group: &ActualLrpGroup,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
        net_info: ActualLrpNetInfo,
    ) -> Result<KeepContainer, LrpError> {
        if let Some(existing) = &group.evacuating {
            if !existing.is_owned_by(instance_key) {
                info!("Slot already evacuated by a different cell");
                return Ok(false);
            }
        }
        self.upsert_evacuating(group.evacuating.clone(), key, instance_key, net_info)
            .await?;
        Ok(true)
    }

    async fn remove_owned_evacuating(
        &self,
        group: &ActualLrpGroup,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<(), LrpError> {
        if owns_evacuating(group, instance_key) {
            match self
                .remove_record(Presence::Evacuating, key, Some(instance_key))
                .await
            {
                Ok(_) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Creates or refreshes the slot's evacuating record as Running on
    /// `instance_key`.
    async fn upsert_evacuating(
        &self,
        existing: Option<ActualLrp>,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
        net_info: ActualLrpNetInfo,
    ) -> Result<ActualLrp, LrpError> {
        match existing {
            Some(before) => {
                if before.state == ActualLrpState::Running
                    && before.is_owned_by(instance_key)
                    && before.net_info == net_info
                {
                    return Ok(before);
                }
                let mut after = before.clone();
                after.state = ActualLrpState::Running;
                after.instance_key = Some(instance_key.clone());
                after.net_info = net_info;
                self.write(Presence::Evacuating, &before, &mut after)
                    .await?;
                self.emit_changed(Presence::Evacuating, before, after.clone());
                Ok(after)
            }
            None => {
                let mut lrp = ActualLrp::unclaimed(key.clone(), Utc::now());
                lrp.state = ActualLrpState::Running;
                lrp.instance_key = Some(instance_key.clone());
                lrp.net_info = net_info;
                self.store
                    .create_actual_lrp(Presence::Evacuating, &lrp)
                    .await
                    .map_err(|e| self.store_error(e))?;
                self.emitter.emit(Event::ActualLrpCreated {
                    actual_lrp_group: ActualLrpGroup::evacuating(lrp.clone()),
                });
                Ok(lrp)
            }
        }
    }
}

fn owns_evacuating(group: &ActualLrpGroup, instance_key: &ActualLrpInstanceKey) -> bool {
    group
        .evacuating
        .as_ref()
        .is_some_and(|e| e.is_owned_by(instance_key))
}
