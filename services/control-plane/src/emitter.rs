//! Asynchronous hand-off from committed writes to the event hubs.
//!
//! Controllers call [`EventEmitter::emit`] after a write succeeds. The call
//! only enqueues; a single dispatcher task routes events to the desired or
//! actual hub in the order they were emitted.

use lrp_events::{Event, EventCategory, EventHub};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Cheap, cloneable handle onto the dispatcher task.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventEmitter {
    /// Starts the dispatcher. It runs until every emitter clone is dropped.
    pub fn spawn(desired_hub: EventHub, actual_hub: EventHub) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                debug!(event_type = event.event_type(), "Dispatching event");
                match event.category() {
                    EventCategory::Desired => desired_hub.emit(event),
                    EventCategory::Actual => actual_hub.emit(event),
                }
            }
            debug!("Event dispatcher stopped");
        });
        (Self { tx }, handle)
    }

    /// Queues an event without waiting.
    pub fn emit(&self, event: Event) {
        if let Err(err) = self.tx.send(event) {
            warn!(
                event_type = err.0.event_type(),
                "Event dispatcher stopped; dropping event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lrp_events::{ActualLrp, ActualLrpGroup, ActualLrpKey};
    use lrp_id::{Domain, ProcessGuid};
    use std::time::Duration;

    fn actual_created(index: u32) -> Event {
        let key = ActualLrpKey::new(
            ProcessGuid::parse("web").unwrap(),
            index,
            Domain::parse("cf-apps").unwrap(),
        );
        Event::ActualLrpCreated {
            actual_lrp_group: ActualLrpGroup::ordinary(ActualLrp::unclaimed(key, Utc::now())),
        }
    }

    #[tokio::test]
    async fn test_routes_by_category_in_order() {
        let desired = EventHub::new("desired", 16);
        let actual = EventHub::new("actual", 16);
        let mut desired_sub = desired.subscribe().unwrap();
        let mut actual_sub = actual.subscribe().unwrap();

        let (emitter, handle) = EventEmitter::spawn(desired.clone(), actual.clone());
        for index in 0..5 {
            emitter.emit(actual_created(index));
        }

        for index in 0..5 {
            let event = tokio::time::timeout(Duration::from_secs(1), actual_sub.next())
                .await
                .unwrap()
                .unwrap();
            match event {
                Event::ActualLrpCreated { actual_lrp_group } => {
                    assert_eq!(actual_lrp_group.instance.unwrap().key.index, index);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }

        drop(emitter);
        handle.await.unwrap();
        desired.close().unwrap();
        assert!(desired_sub.next().await.is_err());
    }
}
