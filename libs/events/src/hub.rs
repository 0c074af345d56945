//! In-process publish/subscribe hub.
//!
//! Each subscription owns a bounded queue. [`EventHub::emit`] never waits:
//! when a subscriber's queue is full the subscriber is evicted and its next
//! read fails with [`HubError::SlowConsumer`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::{Event, HubError};

/// Default per-subscriber queue depth.
pub const DEFAULT_MAX_PENDING_EVENTS: usize = 1024;

type CountCallback = Arc<dyn Fn(usize) + Send + Sync>;

// Subscription status values.
const OPEN: u8 = 0;
const EVICTED: u8 = 1;
const HUB_CLOSED: u8 = 2;
const CLOSED: u8 = 3;

struct Slot {
    tx: mpsc::Sender<Event>,
    status: Arc<AtomicU8>,
}

impl Slot {
    fn mark(&self, status: u8) {
        let _ = self
            .status
            .compare_exchange(OPEN, status, Ordering::AcqRel, Ordering::Acquire);
    }
}

#[derive(Default)]
struct HubState {
    subscribers: HashMap<u64, Slot>,
    closed: bool,
    callback: Option<CountCallback>,
}

impl HubState {
    fn count_notification(&self) -> Option<(CountCallback, usize)> {
        self.callback
            .clone()
            .map(|cb| (cb, self.subscribers.len()))
    }
}

struct HubInner {
    name: &'static str,
    capacity: usize,
    next_id: AtomicU64,
    state: Mutex<HubState>,
}

impl HubInner {
    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unsubscribe(&self, id: u64) {
        let notify = {
            let mut state = self.lock();
            if state.subscribers.remove(&id).is_none() {
                return;
            }
            state.count_notification()
        };
        debug!(hub = self.name, subscriber = id, "subscriber left");
        notify_count(notify);
    }
}

fn notify_count(notify: Option<(CountCallback, usize)>) {
    if let Some((cb, count)) = notify {
        cb(count);
    }
}

/// Fan-out broker for one event category.
///
/// Cloning is cheap and every clone refers to the same hub.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.capacity)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventHub {
    /// Creates a hub whose subscribers buffer at most `capacity` events.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                name,
                capacity: capacity.max(1),
                next_id: AtomicU64::new(1),
                state: Mutex::new(HubState::default()),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Delivers `event` to every live subscriber without blocking.
    ///
    /// Subscribers whose queue is full are evicted. Emitting on a closed hub
    /// is a no-op.
    pub fn emit(&self, event: Event) {
        let notify = {
            let mut state = self.inner.lock();
            if state.closed {
                return;
            }

            let mut dropped = Vec::new();
            for (id, slot) in &state.subscribers {
                match slot.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        slot.mark(EVICTED);
                        dropped.push(*id);
                    }
                    Err(TrySendError::Closed(_)) => dropped.push(*id),
                }
            }

            if dropped.is_empty() {
                return;
            }
            for id in &dropped {
                state.subscribers.remove(id);
            }
            warn!(
                hub = self.inner.name,
                event_type = event.event_type(),
                evicted = dropped.len(),
                remaining = state.subscribers.len(),
                "evicted slow subscribers"
            );
            state.count_notification()
        };
        notify_count(notify);
    }

    /// Registers a new subscriber.
    pub fn subscribe(&self) -> Result<Subscription, HubError> {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let status = Arc::new(AtomicU8::new(OPEN));
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let notify = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(HubError::SubscribedToClosedHub);
            }
            state.subscribers.insert(
                id,
                Slot {
                    tx,
                    status: Arc::clone(&status),
                },
            );
            state.count_notification()
        };
        debug!(hub = self.inner.name, subscriber = id, "subscriber joined");
        notify_count(notify);

        Ok(Subscription {
            id,
            rx,
            status,
            hub: Arc::downgrade(&self.inner),
        })
    }

    /// Sets the subscriber-count callback.
    ///
    /// The callback runs immediately with the current count and again after
    /// every change. It must not call back into the hub.
    pub fn register_callback<F>(&self, callback: F)
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        let callback: CountCallback = Arc::new(callback);
        let count = {
            let mut state = self.inner.lock();
            state.callback = Some(Arc::clone(&callback));
            state.subscribers.len()
        };
        callback(count);
    }

    /// Closes the hub, terminating every subscription.
    pub fn close(&self) -> Result<(), HubError> {
        let notify = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(HubError::HubAlreadyClosed);
            }
            state.closed = true;
            for slot in state.subscribers.values() {
                slot.mark(HUB_CLOSED);
            }
            // Dropping the senders wakes every pending reader.
            state.subscribers.clear();
            state.count_notification()
        };
        info!(hub = self.inner.name, "event hub closed");
        notify_count(notify);
        Ok(())
    }
}

/// A subscriber's handle onto an [`EventHub`].
///
/// Dropping the handle unsubscribes it.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Event>,
    status: Arc<AtomicU8>,
    hub: Weak<HubInner>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("status", &self.status.load(Ordering::Acquire))
            .finish()
    }
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the next event in emission order.
    pub async fn next(&mut self) -> Result<Event, HubError> {
        self.check()?;
        let event = self.rx.recv().await;
        self.check()?;
        event.ok_or(HubError::HubClosed)
    }

    /// Closes the subscription. A second close is an error.
    pub fn close(&mut self) -> Result<(), HubError> {
        let previous = self.status.swap(CLOSED, Ordering::AcqRel);
        if previous == CLOSED {
            return Err(HubError::SourceAlreadyClosed);
        }
        self.rx.close();
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(self.id);
        }
        Ok(())
    }

    fn check(&self) -> Result<(), HubError> {
        match self.status.load(Ordering::Acquire) {
            OPEN => Ok(()),
            EVICTED => Err(HubError::SlowConsumer),
            HUB_CLOSED => Err(HubError::HubClosed),
            _ => Err(HubError::ReadFromClosedSource),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(self.id);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
