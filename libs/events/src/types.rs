//! Desired and actual LRP models.
//!
//! A desired LRP describes what should run; actual LRPs describe the
//! instances observed on cells. Each actual slot is addressed by an
//! [`ActualLrpKey`] and may hold an ordinary record and an evacuating record
//! at the same time.

use chrono::{DateTime, Utc};
use lrp_id::{CellId, Domain, InstanceGuid, ProcessGuid, Ulid};
use serde::{Deserialize, Serialize};

use crate::ValidationError;

/// Maximum annotation size in bytes.
pub const MAX_ANNOTATION_BYTES: usize = 10 * 1024;

// =============================================================================
// Modification Tags
// =============================================================================

/// Version stamp carried by every stored record.
///
/// The epoch is fixed when the record is created; the index increases on
/// every write. Conditional writes compare the whole tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModificationTag {
    pub epoch: String,
    pub index: u32,
}

impl ModificationTag {
    /// A fresh tag for a newly created record.
    pub fn new() -> Self {
        Self {
            epoch: Ulid::new().to_string(),
            index: 0,
        }
    }

    /// Advances the index in place.
    pub fn increment(&mut self) {
        self.index = self.index.wrapping_add(1);
    }

    /// Returns the tag that follows this one.
    #[must_use]
    pub fn next(&self) -> Self {
        let mut tag = self.clone();
        tag.increment();
        tag
    }
}

impl Default for ModificationTag {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Desired LRPs
// =============================================================================

/// Resource requirements for every instance of a desired LRP.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub memory_mb: u32,
    pub disk_mb: u32,
    pub max_pids: u32,
}

/// Placement constraints for every instance of a desired LRP.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementConstraint {
    pub root_fs: String,
    #[serde(default)]
    pub volume_drivers: Vec<String>,
    #[serde(default)]
    pub placement_tags: Vec<String>,
}

/// The scheduling-relevant part of a desired LRP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredLrpSchedulingInfo {
    pub process_guid: ProcessGuid,
    pub domain: Domain,
    pub instances: u32,
    pub resources: Resources,
    pub placement: PlacementConstraint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
    #[serde(default)]
    pub modification_tag: ModificationTag,
}

impl DesiredLrpSchedulingInfo {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.placement.root_fs.trim().is_empty() {
            return Err(ValidationError::new("root_fs", "must not be empty"));
        }
        if let Some(annotation) = &self.annotation {
            validate_annotation(annotation)?;
        }
        if self.placement.volume_drivers.iter().any(|d| d.is_empty()) {
            return Err(ValidationError::new(
                "volume_drivers",
                "driver names must not be empty",
            ));
        }
        Ok(())
    }

    /// Applies an update, returning true if anything changed.
    pub fn apply(&mut self, update: &DesiredLrpUpdate) -> bool {
        let mut changed = false;
        if let Some(instances) = update.instances {
            changed |= self.instances != instances;
            self.instances = instances;
        }
        if let Some(annotation) = &update.annotation {
            changed |= self.annotation.as_deref() != Some(annotation.as_str());
            self.annotation = Some(annotation.clone());
        }
        changed
    }
}

/// A partial update to a desired LRP.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredLrpUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instances: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
}

impl DesiredLrpUpdate {
    pub fn instances(count: u32) -> Self {
        Self {
            instances: Some(count),
            annotation: None,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.instances.is_none() && self.annotation.is_none() {
            return Err(ValidationError::new("update", "no fields to update"));
        }
        if let Some(annotation) = &self.annotation {
            validate_annotation(annotation)?;
        }
        Ok(())
    }
}

fn validate_annotation(annotation: &str) -> Result<(), ValidationError> {
    if annotation.len() > MAX_ANNOTATION_BYTES {
        return Err(ValidationError::new(
            "annotation",
            format!("exceeds {MAX_ANNOTATION_BYTES} bytes"),
        ));
    }
    Ok(())
}

/// Filter for desired LRP reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredLrpFilter {
    #[serde(default)]
    pub domain: Option<Domain>,
}

impl DesiredLrpFilter {
    pub fn matches(&self, desired: &DesiredLrpSchedulingInfo) -> bool {
        self.domain.as_ref().is_none_or(|d| *d == desired.domain)
    }
}

// =============================================================================
// Actual LRPs
// =============================================================================

/// Identifies one logical instance slot of a desired LRP.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActualLrpKey {
    pub process_guid: ProcessGuid,
    pub index: u32,
    pub domain: Domain,
}

impl ActualLrpKey {
    pub fn new(process_guid: ProcessGuid, index: u32, domain: Domain) -> Self {
        Self {
            process_guid,
            index,
            domain,
        }
    }
}

impl std::fmt::Display for ActualLrpKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.process_guid, self.index)
    }
}

/// Identifies the concrete instance occupying a slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActualLrpInstanceKey {
    pub instance_guid: InstanceGuid,
    pub cell_id: CellId,
}

impl ActualLrpInstanceKey {
    pub fn new(instance_guid: InstanceGuid, cell_id: CellId) -> Self {
        Self {
            instance_guid,
            cell_id,
        }
    }
}

/// Observed state of an actual LRP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActualLrpState {
    Unclaimed,
    Claimed,
    Running,
    Crashed,
}

impl ActualLrpState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unclaimed => "UNCLAIMED",
            Self::Claimed => "CLAIMED",
            Self::Running => "RUNNING",
            Self::Crashed => "CRASHED",
        }
    }

    /// Returns true if a cell is expected to hold a container for this state.
    pub fn is_placed(&self) -> bool {
        matches!(self, Self::Claimed | Self::Running)
    }
}

impl std::fmt::Display for ActualLrpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A host/container port pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
}

/// Where a running instance can be reached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActualLrpNetInfo {
    pub address: String,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
}

impl ActualLrpNetInfo {
    pub fn new(address: impl Into<String>, ports: Vec<PortMapping>) -> Self {
        Self {
            address: address.into(),
            ports,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.address.is_empty() && self.ports.is_empty()
    }
}

/// An observed instance record for one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActualLrp {
    pub key: ActualLrpKey,
    /// `None` while Unclaimed or Crashed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_key: Option<ActualLrpInstanceKey>,
    pub state: ActualLrpState,
    #[serde(default)]
    pub net_info: ActualLrpNetInfo,
    /// When the record entered its current state.
    pub since: DateTime<Utc>,
    #[serde(default)]
    pub crash_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crash_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement_error: Option<String>,
    pub modification_tag: ModificationTag,
}

impl ActualLrp {
    /// A fresh Unclaimed record for a slot.
    pub fn unclaimed(key: ActualLrpKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            instance_key: None,
            state: ActualLrpState::Unclaimed,
            net_info: ActualLrpNetInfo::default(),
            since: now,
            crash_count: 0,
            crash_reason: None,
            placement_error: None,
            modification_tag: ModificationTag::new(),
        }
    }

    /// Cell currently holding the instance, if any.
    pub fn cell_id(&self) -> Option<&CellId> {
        self.instance_key.as_ref().map(|ik| &ik.cell_id)
    }

    /// Returns true if `instance_key` owns this record.
    pub fn is_owned_by(&self, instance_key: &ActualLrpInstanceKey) -> bool {
        self.instance_key.as_ref() == Some(instance_key)
    }

    /// Clears placement-specific fields and moves to `state`.
    pub fn vacate(&mut self, state: ActualLrpState, now: DateTime<Utc>) {
        self.instance_key = None;
        self.net_info = ActualLrpNetInfo::default();
        self.state = state;
        self.since = now;
    }
}

/// Which record of a group an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Ordinary,
    Evacuating,
}

/// Both records that may exist for one slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActualLrpGroup {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<ActualLrp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evacuating: Option<ActualLrp>,
}

impl ActualLrpGroup {
    pub fn ordinary(lrp: ActualLrp) -> Self {
        Self {
            instance: Some(lrp),
            evacuating: None,
        }
    }

    pub fn evacuating(lrp: ActualLrp) -> Self {
        Self {
            instance: None,
            evacuating: Some(lrp),
        }
    }

    /// Prefers the ordinary record, falling back to the evacuating one.
    pub fn resolve(&self) -> Option<(&ActualLrp, Presence)> {
        match (&self.instance, &self.evacuating) {
            (Some(lrp), _) => Some((lrp, Presence::Ordinary)),
            (None, Some(lrp)) => Some((lrp, Presence::Evacuating)),
            (None, None) => None,
        }
    }

    pub fn get(&self, presence: Presence) -> Option<&ActualLrp> {
        match presence {
            Presence::Ordinary => self.instance.as_ref(),
            Presence::Evacuating => self.evacuating.as_ref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.instance.is_none() && self.evacuating.is_none()
    }
}

/// Filter for actual LRP reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActualLrpFilter {
    #[serde(default)]
    pub domain: Option<Domain>,
    #[serde(default)]
    pub cell_id: Option<CellId>,
    #[serde(default)]
    pub process_guid: Option<ProcessGuid>,
    #[serde(default)]
    pub index: Option<u32>,
}

impl ActualLrpFilter {
    pub fn for_process(process_guid: ProcessGuid) -> Self {
        Self {
            process_guid: Some(process_guid),
            ..Self::default()
        }
    }

    /// Matches one record.
    pub fn matches(&self, lrp: &ActualLrp) -> bool {
        self.domain.as_ref().is_none_or(|d| *d == lrp.key.domain)
            && self
                .process_guid
                .as_ref()
                .is_none_or(|p| *p == lrp.key.process_guid)
            && self.index.is_none_or(|i| i == lrp.key.index)
            && self
                .cell_id
                .as_ref()
                .is_none_or(|c| lrp.cell_id() == Some(c))
    }

    /// Narrows a group to the records that match, or `None` if none do.
    pub fn apply(&self, group: &ActualLrpGroup) -> Option<ActualLrpGroup> {
        let narrowed = ActualLrpGroup {
            instance: group.instance.clone().filter(|l| self.matches(l)),
            evacuating: group.evacuating.clone().filter(|l| self.matches(l)),
        };
        (!narrowed.is_empty()).then_some(narrowed)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn key(index: u32) -> ActualLrpKey {
        ActualLrpKey::new(
            ProcessGuid::parse("web").unwrap(),
            index,
            Domain::parse("cf-apps").unwrap(),
        )
    }

    fn desired() -> DesiredLrpSchedulingInfo {
        DesiredLrpSchedulingInfo {
            process_guid: ProcessGuid::parse("web").unwrap(),
            domain: Domain::parse("cf-apps").unwrap(),
            instances: 2,
            resources: Resources {
                memory_mb: 256,
                disk_mb: 1024,
                max_pids: 100,
            },
            placement: PlacementConstraint {
                root_fs: "preloaded:cflinuxfs4".to_string(),
                ..Default::default()
            },
            annotation: None,
            modification_tag: ModificationTag::new(),
        }
    }

    #[test]
    fn test_resolve_prefers_instance() {
        let ordinary = ActualLrp::unclaimed(key(0), Utc::now());
        let mut evac = ordinary.clone();
        evac.state = ActualLrpState::Running;

        let group = ActualLrpGroup {
            instance: Some(ordinary.clone()),
            evacuating: Some(evac.clone()),
        };
        let (lrp, presence) = group.resolve().unwrap();
        assert_eq!(lrp, &ordinary);
        assert_eq!(presence, Presence::Ordinary);

        let group = ActualLrpGroup::evacuating(evac.clone());
        assert_eq!(group.resolve(), Some((&evac, Presence::Evacuating)));
        assert!(ActualLrpGroup::default().resolve().is_none());
    }

    #[test]
    fn test_state_serializes_uppercase() {
        let json = serde_json::to_string(&ActualLrpState::Unclaimed).unwrap();
        assert_eq!(json, "\"UNCLAIMED\"");
    }

    #[test]
    fn test_desired_validation_requires_rootfs() {
        let mut d = desired();
        assert!(d.validate().is_ok());
        d.placement.root_fs = "  ".to_string();
        assert_eq!(d.validate().unwrap_err().field, "root_fs");
    }

    #[test]
    fn test_update_requires_a_field() {
        assert!(DesiredLrpUpdate::default().validate().is_err());
        assert!(DesiredLrpUpdate::instances(0).validate().is_ok());
    }

    #[test]
    fn test_update_rejects_large_annotation() {
        let update = DesiredLrpUpdate {
            instances: None,
            annotation: Some("x".repeat(MAX_ANNOTATION_BYTES + 1)),
        };
        assert_eq!(update.validate().unwrap_err().field, "annotation");
    }

    #[test]
    fn test_apply_reports_changes() {
        let mut d = desired();
        assert!(!d.apply(&DesiredLrpUpdate::instances(2)));
        assert!(d.apply(&DesiredLrpUpdate::instances(5)));
        assert_eq!(d.instances, 5);
    }

    #[test]
    fn test_actual_filter_by_cell() {
        let mut running = ActualLrp::unclaimed(key(1), Utc::now());
        running.state = ActualLrpState::Running;
        running.instance_key = Some(ActualLrpInstanceKey::new(
            InstanceGuid::new(),
            CellId::parse("cell-a").unwrap(),
        ));
        let group = ActualLrpGroup::ordinary(running);

        let on_a = ActualLrpFilter {
            cell_id: Some(CellId::parse("cell-a").unwrap()),
            ..Default::default()
        };
        let on_b = ActualLrpFilter {
            cell_id: Some(CellId::parse("cell-b").unwrap()),
            ..Default::default()
        };
        assert!(on_a.apply(&group).is_some());
        assert!(on_b.apply(&group).is_none());
    }

    #[test]
    fn test_modification_tag_next() {
        let tag = ModificationTag::new();
        let next = tag.next();
        assert_eq!(next.epoch, tag.epoch);
        assert_eq!(next.index, tag.index + 1);
    }
}
