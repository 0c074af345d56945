//! Cell-scoped filtering of events for stream observers.

use lrp_id::CellId;

use crate::{ActualLrpGroup, Event};

/// Decides whether an event should be forwarded to an observer.
///
/// Desired events always pass. Actual events pass when the resolved record
/// of any snapshot they carry lives on the filtered cell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    cell_id: Option<CellId>,
}

impl EventFilter {
    /// A filter that forwards everything.
    pub fn all() -> Self {
        Self { cell_id: None }
    }

    pub fn for_cell(cell_id: CellId) -> Self {
        Self {
            cell_id: Some(cell_id),
        }
    }

    pub fn cell_id(&self) -> Option<&CellId> {
        self.cell_id.as_ref()
    }

    pub fn matches(&self, event: &Event) -> bool {
        let Some(cell_id) = &self.cell_id else {
            return true;
        };

        match event {
            Event::DesiredLrpCreated { .. }
            | Event::DesiredLrpChanged { .. }
            | Event::DesiredLrpRemoved { .. } => true,
            Event::ActualLrpCreated { actual_lrp_group }
            | Event::ActualLrpRemoved { actual_lrp_group } => on_cell(actual_lrp_group, cell_id),
            Event::ActualLrpChanged { before, after } => {
                on_cell(before, cell_id) || on_cell(after, cell_id)
            }
            Event::ActualLrpCrashed { instance_key, .. } => instance_key.cell_id == *cell_id,
        }
    }
}

fn on_cell(group: &ActualLrpGroup, cell_id: &CellId) -> bool {
    group
        .resolve()
        .and_then(|(lrp, _)| lrp.cell_id())
        .is_some_and(|c| c == cell_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ActualLrp, ActualLrpInstanceKey, ActualLrpKey, ActualLrpState, DesiredLrpSchedulingInfo,
        ModificationTag, PlacementConstraint, Resources,
    };
    use chrono::Utc;
    use lrp_id::{Domain, InstanceGuid, ProcessGuid};
    use rstest::rstest;

    fn cell(name: &str) -> CellId {
        CellId::parse(name).unwrap()
    }

    fn lrp_on(cell_name: Option<&str>) -> ActualLrp {
        let key = ActualLrpKey::new(
            ProcessGuid::parse("web").unwrap(),
            0,
            Domain::parse("cf-apps").unwrap(),
        );
        let mut lrp = ActualLrp::unclaimed(key, Utc::now());
        if let Some(name) = cell_name {
            lrp.state = ActualLrpState::Running;
            lrp.instance_key = Some(ActualLrpInstanceKey::new(InstanceGuid::new(), cell(name)));
        }
        lrp
    }

    fn group_on(cell_name: Option<&str>) -> ActualLrpGroup {
        ActualLrpGroup::ordinary(lrp_on(cell_name))
    }

    #[rstest]
    #[case(None, false)]
    #[case(Some("cell-a"), true)]
    #[case(Some("cell-b"), false)]
    fn test_created_filtered_by_cell(#[case] on: Option<&str>, #[case] expected: bool) {
        let filter = EventFilter::for_cell(cell("cell-a"));
        let event = Event::ActualLrpCreated {
            actual_lrp_group: group_on(on),
        };
        assert_eq!(filter.matches(&event), expected);
        assert!(EventFilter::all().matches(&event));
    }

    #[test]
    fn test_changed_matches_either_side() {
        let filter = EventFilter::for_cell(cell("cell-a"));
        let moved_away = Event::ActualLrpChanged {
            before: group_on(Some("cell-a")),
            after: group_on(None),
        };
        let moved_in = Event::ActualLrpChanged {
            before: group_on(None),
            after: group_on(Some("cell-a")),
        };
        let elsewhere = Event::ActualLrpChanged {
            before: group_on(Some("cell-b")),
            after: group_on(Some("cell-c")),
        };
        assert!(filter.matches(&moved_away));
        assert!(filter.matches(&moved_in));
        assert!(!filter.matches(&elsewhere));
    }

    #[test]
    fn test_crashed_matches_crashing_cell() {
        let before = lrp_on(Some("cell-a"));
        let instance_key = before.instance_key.clone().unwrap();
        let event = Event::ActualLrpCrashed {
            key: before.key.clone(),
            instance_key,
            crash_count: 1,
            crash_reason: "oom".to_string(),
            before: ActualLrpGroup::ordinary(before),
            after: group_on(None),
        };
        assert!(EventFilter::for_cell(cell("cell-a")).matches(&event));
        assert!(!EventFilter::for_cell(cell("cell-b")).matches(&event));
    }

    #[test]
    fn test_desired_events_always_pass() {
        let event = Event::DesiredLrpCreated {
            desired_lrp: DesiredLrpSchedulingInfo {
                process_guid: ProcessGuid::parse("web").unwrap(),
                domain: Domain::parse("cf-apps").unwrap(),
                instances: 1,
                resources: Resources::default(),
                placement: PlacementConstraint {
                    root_fs: "preloaded:cflinuxfs4".to_string(),
                    ..Default::default()
                },
                annotation: None,
                modification_tag: ModificationTag::new(),
            },
        };
        assert!(EventFilter::for_cell(cell("cell-z")).matches(&event));
    }
}
