//! The closed set of LRP change events.

use lrp_id::ProcessGuid;
use serde::{Deserialize, Serialize};

use crate::{ActualLrpGroup, ActualLrpInstanceKey, ActualLrpKey, DesiredLrpSchedulingInfo};

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    // Desired LRP
    pub const DESIRED_LRP_CREATED: &str = "desired_lrp.created";
    pub const DESIRED_LRP_CHANGED: &str = "desired_lrp.changed";
    pub const DESIRED_LRP_REMOVED: &str = "desired_lrp.removed";

    // Actual LRP
    pub const ACTUAL_LRP_CREATED: &str = "actual_lrp.created";
    pub const ACTUAL_LRP_CHANGED: &str = "actual_lrp.changed";
    pub const ACTUAL_LRP_REMOVED: &str = "actual_lrp.removed";
    pub const ACTUAL_LRP_CRASHED: &str = "actual_lrp.crashed";
}

/// Which hub an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Desired,
    Actual,
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventCategory::Desired => write!(f, "desired"),
            EventCategory::Actual => write!(f, "actual"),
        }
    }
}

// =============================================================================
// Events
// =============================================================================

/// A committed state change.
///
/// Snapshots are full copies taken at emission time; receivers may hold them
/// for as long as they like.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    #[serde(rename = "desired_lrp.created")]
    DesiredLrpCreated { desired_lrp: DesiredLrpSchedulingInfo },

    #[serde(rename = "desired_lrp.changed")]
    DesiredLrpChanged {
        before: DesiredLrpSchedulingInfo,
        after: DesiredLrpSchedulingInfo,
    },

    #[serde(rename = "desired_lrp.removed")]
    DesiredLrpRemoved { desired_lrp: DesiredLrpSchedulingInfo },

    #[serde(rename = "actual_lrp.created")]
    ActualLrpCreated { actual_lrp_group: ActualLrpGroup },

    #[serde(rename = "actual_lrp.changed")]
    ActualLrpChanged {
        before: ActualLrpGroup,
        after: ActualLrpGroup,
    },

    #[serde(rename = "actual_lrp.removed")]
    ActualLrpRemoved { actual_lrp_group: ActualLrpGroup },

    /// One crash of one instance. `after` reflects any immediate restart.
    #[serde(rename = "actual_lrp.crashed")]
    ActualLrpCrashed {
        key: ActualLrpKey,
        instance_key: ActualLrpInstanceKey,
        crash_count: u32,
        crash_reason: String,
        before: ActualLrpGroup,
        after: ActualLrpGroup,
    },
}

impl Event {
    pub fn event_type(&self) -> &'static str {
        use event_types::*;
        match self {
            Event::DesiredLrpCreated { .. } => DESIRED_LRP_CREATED,
            Event::DesiredLrpChanged { .. } => DESIRED_LRP_CHANGED,
            Event::DesiredLrpRemoved { .. } => DESIRED_LRP_REMOVED,
            Event::ActualLrpCreated { .. } => ACTUAL_LRP_CREATED,
            Event::ActualLrpChanged { .. } => ACTUAL_LRP_CHANGED,
            Event::ActualLrpRemoved { .. } => ACTUAL_LRP_REMOVED,
            Event::ActualLrpCrashed { .. } => ACTUAL_LRP_CRASHED,
        }
    }

    pub fn category(&self) -> EventCategory {
        match self {
            Event::DesiredLrpCreated { .. }
            | Event::DesiredLrpChanged { .. }
            | Event::DesiredLrpRemoved { .. } => EventCategory::Desired,
            _ => EventCategory::Actual,
        }
    }

    /// Process guid the event concerns, when one can be determined.
    pub fn process_guid(&self) -> Option<&ProcessGuid> {
        match self {
            Event::DesiredLrpCreated { desired_lrp } | Event::DesiredLrpRemoved { desired_lrp } => {
                Some(&desired_lrp.process_guid)
            }
            Event::DesiredLrpChanged { after, .. } => Some(&after.process_guid),
            Event::ActualLrpCreated { actual_lrp_group }
            | Event::ActualLrpRemoved { actual_lrp_group } => actual_lrp_group
                .resolve()
                .map(|(lrp, _)| &lrp.key.process_guid),
            Event::ActualLrpChanged { before, after } => after
                .resolve()
                .or_else(|| before.resolve())
                .map(|(lrp, _)| &lrp.key.process_guid),
            Event::ActualLrpCrashed { key, .. } => Some(&key.process_guid),
        }
    }

    /// Serializes only the payload, without the type tag.
    pub fn data(&self) -> Result<serde_json::Value, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        Ok(value
            .get_mut("data")
            .map(serde_json::Value::take)
            .unwrap_or(serde_json::Value::Null))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ActualLrp, ModificationTag, PlacementConstraint, Resources};
    use chrono::Utc;
    use lrp_id::Domain;

    fn desired() -> DesiredLrpSchedulingInfo {
        DesiredLrpSchedulingInfo {
            process_guid: ProcessGuid::parse("worker").unwrap(),
            domain: Domain::parse("cf-tasks").unwrap(),
            instances: 1,
            resources: Resources::default(),
            placement: PlacementConstraint {
                root_fs: "docker:///busybox".to_string(),
                ..Default::default()
            },
            annotation: Some("build 42".to_string()),
            modification_tag: ModificationTag::new(),
        }
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = Event::DesiredLrpCreated {
            desired_lrp: desired(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event_types::DESIRED_LRP_CREATED);
        assert_eq!(json["data"]["desired_lrp"]["process_guid"], "worker");

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_data_strips_tag() {
        let event = Event::DesiredLrpRemoved {
            desired_lrp: desired(),
        };
        let data = event.data().unwrap();
        assert!(data.get("type").is_none());
        assert_eq!(data["desired_lrp"]["domain"], "cf-tasks");
    }

    #[test]
    fn test_category_and_process_guid() {
        let key = ActualLrpKey::new(
            ProcessGuid::parse("worker").unwrap(),
            3,
            Domain::parse("cf-tasks").unwrap(),
        );
        let event = Event::ActualLrpCreated {
            actual_lrp_group: ActualLrpGroup::ordinary(ActualLrp::unclaimed(key, Utc::now())),
        };
        assert_eq!(event.category(), EventCategory::Actual);
        assert_eq!(event.event_type(), "actual_lrp.created");
        assert_eq!(event.process_guid().unwrap().as_str(), "worker");

        let desired_event = Event::DesiredLrpCreated {
            desired_lrp: desired(),
        };
        assert_eq!(desired_event.category(), EventCategory::Desired);
    }
}
