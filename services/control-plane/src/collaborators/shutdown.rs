//! Shutdown notification over a `watch` channel.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tracing::warn;

use super::ShutdownNotifier;

/// Flips a `watch` channel to `true` the first time it is notified.
#[derive(Debug)]
pub struct WatchShutdown {
    tx: watch::Sender<bool>,
    fired: AtomicBool,
}

impl WatchShutdown {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                tx,
                fired: AtomicBool::new(false),
            },
            rx,
        )
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

impl ShutdownNotifier for WatchShutdown {
    fn notify(&self) {
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!("Shutdown requested");
        self.tx.send_replace(true);
    }
}
