//! Convergence background worker.
//!
//! Runs LRP convergence on a periodic interval.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, instrument};

use super::ActualLrpController;
use crate::error::ErrorKind;

/// Periodically converges actual LRPs toward their desired state.
pub struct ConvergenceWorker {
    controller: ActualLrpController,
    interval: Duration,
}

impl ConvergenceWorker {
    pub fn new(controller: ActualLrpController, interval: Duration) -> Self {
        Self {
            controller,
            interval,
        }
    }

    /// Run until shutdown is signaled.
    ///
    /// An unrecoverable storage error also ends the loop; shutdown has
    /// already been raised by the controller at that point.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting convergence worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        // First tick completes immediately; wait a full interval instead.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.controller.converge_lrps(Utc::now()).await {
                        Ok(stats) if stats.changed_anything() => {
                            info!(
                                restarted = stats.restarted,
                                stale_unclaimed = stats.stale_unclaimed,
                                missing_created = stats.missing_created,
                                extra_retired = stats.extra_retired,
                                orphans_retired = stats.orphans_retired,
                                failed = stats.failed,
                                "Convergence complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) if e.kind() == ErrorKind::Unrecoverable => {
                            error!(error = %e, "Convergence stopped on storage failure");
                            break;
                        }
                        Err(e) => error!(error = %e, "Convergence failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Convergence worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use crate::test_support::Harness;
    use lrp_events::{ActualLrp, ActualLrpState, Presence};

    #[tokio::test]
    async fn test_converges_on_tick_and_stops_on_shutdown() {
        let h = Harness::new();
        h.store.create_desired_lrp(&h.desired(2)).await.unwrap();
        let mut lrp = ActualLrp::unclaimed(h.key(0), Utc::now());
        lrp.state = ActualLrpState::Crashed;
        lrp.crash_count = 1;
        h.put_actual(Presence::Ordinary, &lrp).await;

        let (tx, rx) = watch::channel(false);
        let worker = ConvergenceWorker::new(h.controller.clone(), Duration::from_millis(20));
        let handle = tokio::spawn(async move { worker.run(rx).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.ordinary(0).await.unwrap().state, ActualLrpState::Unclaimed);
        // The missing index is created too.
        assert_eq!(h.ordinary(1).await.unwrap().state, ActualLrpState::Unclaimed);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
