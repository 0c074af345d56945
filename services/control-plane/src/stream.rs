//! Outbound event streams.
//!
//! A stream merges one subscription per hub into a single ordered sequence
//! of numbered frames. Each hub gets a producer task feeding one bounded
//! channel; all producers share one cancellation token, which fires on the
//! first terminal error, on [`EventStream::cancel`], or when the stream is
//! dropped.

use futures_core::Stream;
use futures_util::stream::unfold;
use lrp_events::{Event, EventFilter, EventHub, HubError, Subscription};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use crate::error::StreamError;

/// Default bound on events in flight between producers and the consumer.
pub const DEFAULT_STREAM_BUFFER: usize = 256;

/// One forwarded event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamFrame {
    /// Strictly increasing within a stream, starting at 1.
    pub id: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
}

impl StreamFrame {
    pub fn from_event(id: u64, event: &Event) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id,
            event_type: event.event_type().to_string(),
            data: event.data()?,
        })
    }
}

/// Opens merged streams over event hubs.
#[derive(Debug, Clone, Copy)]
pub struct Streamer {
    buffer: usize,
}

impl Default for Streamer {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_BUFFER)
    }
}

impl Streamer {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
        }
    }

    /// Subscribes to every hub and starts one producer per subscription.
    ///
    /// Fails without starting anything if any hub is already closed.
    pub fn open(&self, hubs: &[EventHub], filter: EventFilter) -> Result<EventStream, StreamError> {
        let subscriptions = hubs
            .iter()
            .map(EventHub::subscribe)
            .collect::<Result<Vec<_>, _>>()?;

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(self.buffer);
        for (hub, subscription) in hubs.iter().zip(subscriptions) {
            tokio::spawn(produce(hub.name(), subscription, tx.clone(), cancel.clone()));
        }

        Ok(EventStream {
            rx,
            cancel: cancel.clone(),
            _guard: cancel.drop_guard(),
            next_id: 0,
            filter,
            finished: false,
        })
    }
}

async fn produce(
    hub: &'static str,
    mut subscription: Subscription,
    tx: mpsc::Sender<Result<Event, HubError>>,
    cancel: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = subscription.next() => item,
        };
        let terminal = item.is_err();
        let sent = tokio::select! {
            _ = cancel.cancelled() => break,
            sent = tx.send(item) => sent.is_ok(),
        };
        if terminal {
            cancel.cancel();
        }
        if terminal || !sent {
            break;
        }
    }
    debug!(hub, "Stream producer stopped");
}

/// A merged, filtered and numbered event sequence.
pub struct EventStream {
    rx: mpsc::Receiver<Result<Event, HubError>>,
    cancel: CancellationToken,
    _guard: DropGuard,
    next_id: u64,
    filter: EventFilter,
    finished: bool,
}

impl EventStream {
    /// Next frame, or `None` once the stream has ended.
    ///
    /// A terminal error is returned once; every call after it yields `None`.
    pub async fn next(&mut self) -> Option<Result<StreamFrame, StreamError>> {
        if self.finished {
            return None;
        }
        loop {
            let Some(item) = self.rx.recv().await else {
                self.finish();
                return None;
            };
            let event = match item {
                Ok(event) => event,
                Err(err) => {
                    self.finish();
                    return Some(Err(err.into()));
                }
            };
            if !self.filter.matches(&event) {
                continue;
            }

            self.next_id += 1;
            return match StreamFrame::from_event(self.next_id, &event) {
                Ok(frame) => Some(Ok(frame)),
                Err(err) => {
                    warn!(event_type = event.event_type(), error = %err, "Failed to serialize event");
                    self.finish();
                    Some(Err(err.into()))
                }
            };
        }
    }

    /// Stops every producer. Safe to call more than once.
    pub fn cancel(&mut self) {
        self.finish();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<StreamFrame, StreamError>> + Send {
        unfold(self, |mut stream| async move {
            let item = stream.next().await?;
            Some((item, stream))
        })
    }

    fn finish(&mut self) {
        self.finished = true;
        self.cancel.cancel();
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use futures_util::StreamExt;
    use lrp_events::{
        ActualLrp, ActualLrpGroup, ActualLrpInstanceKey, ActualLrpKey, ActualLrpState,
        DesiredLrpSchedulingInfo, ModificationTag, PlacementConstraint, Resources,
    };
    use lrp_id::{CellId, Domain, InstanceGuid, ProcessGuid};
    use std::time::Duration;

    fn key(index: u32) -> ActualLrpKey {
        ActualLrpKey::new(
            ProcessGuid::parse("web").unwrap(),
            index,
            Domain::parse("cf-apps").unwrap(),
        )
    }

    fn actual_created(index: u32, cell: Option<&str>) -> Event {
        let mut lrp = ActualLrp::unclaimed(key(index), Utc::now());
        if let Some(cell) = cell {
            lrp.state = ActualLrpState::Claimed;
            lrp.instance_key = Some(ActualLrpInstanceKey::new(
                InstanceGuid::new(),
                CellId::parse(cell).unwrap(),
            ));
        }
        Event::ActualLrpCreated {
            actual_lrp_group: ActualLrpGroup::ordinary(lrp),
        }
    }

    fn desired_created() -> Event {
        Event::DesiredLrpCreated {
            desired_lrp: DesiredLrpSchedulingInfo {
                process_guid: ProcessGuid::parse("web").unwrap(),
                domain: Domain::parse("cf-apps").unwrap(),
                instances: 1,
                resources: Resources {
                    memory_mb: 128,
                    disk_mb: 256,
                    max_pids: 64,
                },
                placement: PlacementConstraint {
                    root_fs: "preloaded:cflinuxfs4".to_string(),
                    ..Default::default()
                },
                annotation: None,
                modification_tag: ModificationTag::new(),
            },
        }
    }

    async fn next_frame(stream: &mut EventStream) -> StreamFrame {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timed out")
            .expect("stream ended")
            .expect("stream failed")
    }

    async fn wait_for_subscribers(hub: &EventHub, count: usize) {
        for _ in 0..100 {
            if hub.subscriber_count() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("hub {} never reached {count} subscribers", hub.name());
    }

    #[tokio::test]
    async fn test_merges_hubs_with_increasing_ids() {
        let desired = EventHub::new("desired", 16);
        let actual = EventHub::new("actual", 16);
        let mut stream = Streamer::new(8)
            .open(&[desired.clone(), actual.clone()], EventFilter::all())
            .unwrap();

        actual.emit(actual_created(0, None));
        actual.emit(actual_created(1, None));
        desired.emit(desired_created());

        let mut frames = Vec::new();
        for _ in 0..3 {
            frames.push(next_frame(&mut stream).await);
        }
        let ids: Vec<u64> = frames.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        // Per-hub order survives the merge.
        let actual_indices: Vec<u64> = frames
            .iter()
            .filter(|f| f.event_type == "actual_lrp.created")
            .map(|f| f.data["actual_lrp_group"]["instance"]["key"]["index"].as_u64().unwrap())
            .collect();
        assert_eq!(actual_indices, vec![0, 1]);
        assert!(frames.iter().any(|f| f.event_type == "desired_lrp.created"));
    }

    #[tokio::test]
    async fn test_filter_applies_before_numbering() {
        let actual = EventHub::new("actual", 16);
        let filter = EventFilter::for_cell(CellId::parse("cell-a").unwrap());
        let mut stream = Streamer::default().open(&[actual.clone()], filter).unwrap();

        actual.emit(actual_created(0, Some("cell-b")));
        actual.emit(actual_created(1, Some("cell-a")));
        actual.emit(actual_created(2, None));
        actual.emit(actual_created(3, Some("cell-a")));

        let first = next_frame(&mut stream).await;
        let second = next_frame(&mut stream).await;
        assert_eq!((first.id, second.id), (1, 2));
        assert_eq!(
            first.data["actual_lrp_group"]["instance"]["key"]["index"],
            1
        );
        assert_eq!(
            second.data["actual_lrp_group"]["instance"]["key"]["index"],
            3
        );
    }

    #[tokio::test]
    async fn test_hub_close_ends_stream_and_releases_producers() {
        let desired = EventHub::new("desired", 16);
        let actual = EventHub::new("actual", 16);
        let mut stream = Streamer::default()
            .open(&[desired.clone(), actual.clone()], EventFilter::all())
            .unwrap();
        assert_eq!(desired.subscriber_count(), 1);

        actual.close().unwrap();
        let err = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, StreamError::Hub(HubError::HubClosed)));
        assert!(stream.is_cancelled());
        assert!(stream.next().await.is_none());

        // The other producer gave up its subscription.
        wait_for_subscribers(&desired, 0).await;
    }

    #[tokio::test]
    async fn test_slow_consumer_eviction_ends_stream() {
        let actual = EventHub::new("actual", 1);
        let mut stream = Streamer::new(1).open(&[actual.clone()], EventFilter::all()).unwrap();

        // The producer has not run yet, so the queue overflows on the second emit.
        for index in 0..8 {
            actual.emit(actual_created(index, None));
        }

        let mut ended_with = None;
        while let Some(item) = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
        {
            if let Err(err) = item {
                ended_with = Some(err);
            }
        }
        assert!(matches!(
            ended_with,
            Some(StreamError::Hub(HubError::SlowConsumer))
        ));
    }

    #[tokio::test]
    async fn test_drop_and_cancel_release_subscriptions() {
        let actual = EventHub::new("actual", 16);
        let stream = Streamer::default().open(&[actual.clone()], EventFilter::all()).unwrap();
        assert_eq!(actual.subscriber_count(), 1);
        drop(stream);
        wait_for_subscribers(&actual, 0).await;

        let mut stream = Streamer::default().open(&[actual.clone()], EventFilter::all()).unwrap();
        stream.cancel();
        stream.cancel();
        assert!(stream.next().await.is_none());
        wait_for_subscribers(&actual, 0).await;
    }

    #[tokio::test]
    async fn test_open_on_closed_hub_fails() {
        let desired = EventHub::new("desired", 16);
        let actual = EventHub::new("actual", 16);
        actual.close().unwrap();

        let err = Streamer::default()
            .open(&[desired.clone(), actual], EventFilter::all())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            StreamError::Hub(HubError::SubscribedToClosedHub)
        ));
        assert_eq!(desired.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_into_stream_yields_frames() {
        let actual = EventHub::new("actual", 16);
        let stream = Streamer::default().open(&[actual.clone()], EventFilter::all()).unwrap();
        let frames = stream.into_stream();
        futures_util::pin_mut!(frames);

        actual.emit(actual_created(0, None));
        let first = frames.next().await.unwrap().unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(first.event_type, "actual_lrp.created");

        actual.close().unwrap();
        assert!(frames.next().await.unwrap().is_err());
        assert!(frames.next().await.is_none());
    }
}
