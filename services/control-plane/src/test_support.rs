//! Shared fixtures for unit tests.

use std::sync::Arc;
use std::time::Duration;

use lrp_events::{
    ActualLrp, ActualLrpGroup, ActualLrpInstanceKey, ActualLrpKey, DesiredLrpSchedulingInfo,
    Event, EventHub, ModificationTag, PlacementConstraint, Presence, Resources, Subscription,
};
use lrp_id::{CellId, Domain, InstanceGuid, ProcessGuid};

use crate::actual::ActualLrpController;
use crate::desired::DesiredLrpReconciler;
use crate::emitter::EventEmitter;
use crate::fakes::FakeCollaborators;
use crate::storage::{MemoryStore, Storage};

pub(crate) const PROCESS_GUID: &str = "web";
pub(crate) const DOMAIN: &str = "cf-apps";

pub(crate) struct Harness {
    pub store: Arc<MemoryStore>,
    pub desired_hub: EventHub,
    pub actual_hub: EventHub,
    pub fakes: FakeCollaborators,
    pub controller: ActualLrpController,
    pub reconciler: DesiredLrpReconciler,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let desired_hub = EventHub::new("desired", 64);
        let actual_hub = EventHub::new("actual", 64);
        let (emitter, _) = EventEmitter::spawn(desired_hub.clone(), actual_hub.clone());
        let fakes = FakeCollaborators::with_cells([
            ("cell-a", "http://cell-a:1800"),
            ("cell-b", "http://cell-b:1800"),
        ]);
        let controller = ActualLrpController::new(store.clone(), emitter, fakes.collaborators());
        let reconciler = DesiredLrpReconciler::new(controller.clone(), 4);
        Self {
            store,
            desired_hub,
            actual_hub,
            fakes,
            controller,
            reconciler,
        }
    }

    pub fn key(&self, index: u32) -> ActualLrpKey {
        ActualLrpKey::new(
            ProcessGuid::parse(PROCESS_GUID).unwrap(),
            index,
            Domain::parse(DOMAIN).unwrap(),
        )
    }

    pub fn instance_key(&self, cell: &str) -> ActualLrpInstanceKey {
        ActualLrpInstanceKey::new(InstanceGuid::new(), CellId::parse(cell).unwrap())
    }

    pub fn desired(&self, instances: u32) -> DesiredLrpSchedulingInfo {
        DesiredLrpSchedulingInfo {
            process_guid: ProcessGuid::parse(PROCESS_GUID).unwrap(),
            domain: Domain::parse(DOMAIN).unwrap(),
            instances,
            resources: Resources {
                memory_mb: 256,
                disk_mb: 1024,
                max_pids: 1024,
            },
            placement: PlacementConstraint {
                root_fs: "preloaded:cflinuxfs4".to_string(),
                ..Default::default()
            },
            annotation: None,
            modification_tag: ModificationTag::new(),
        }
    }

    /// Writes a record directly, bypassing the controller.
    pub async fn put_actual(&self, presence: Presence, lrp: &ActualLrp) {
        self.store.create_actual_lrp(presence, lrp).await.unwrap();
    }

    pub async fn group(&self, index: u32) -> Option<ActualLrpGroup> {
        self.store
            .actual_lrp_group(&ProcessGuid::parse(PROCESS_GUID).unwrap(), index)
            .await
            .ok()
    }

    pub async fn ordinary(&self, index: u32) -> Option<ActualLrp> {
        self.group(index).await.and_then(|g| g.instance)
    }

    /// Lets the dispatcher drain events emitted so far.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    /// Subscribes to the actual hub once earlier events have been delivered.
    pub async fn actual_events(&self) -> Subscription {
        self.settle().await;
        self.actual_hub.subscribe().unwrap()
    }

    pub async fn desired_events(&self) -> Subscription {
        self.settle().await;
        self.desired_hub.subscribe().unwrap()
    }
}

pub(crate) async fn next_event(sub: &mut Subscription) -> Event {
    tokio::time::timeout(Duration::from_secs(1), sub.next())
        .await
        .expect("timed out waiting for event")
        .expect("subscription failed")
}

pub(crate) async fn assert_no_event(sub: &mut Subscription) {
    let result = tokio::time::timeout(Duration::from_millis(50), sub.next()).await;
    assert!(result.is_err(), "unexpected event: {result:?}");
}

/// Drains events until the hub has been quiet briefly.
pub(crate) async fn drain(sub: &mut Subscription) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_millis(50), sub.next()).await {
        events.push(event);
    }
    events
}
