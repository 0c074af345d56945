//! Reconciliation primitives.
//!
//! Helpers shared by the desired-to-actual reconciler and crash convergence:
//!
//! - **WorkPool**: bounded concurrency for per-index slot operations.
//! - **Selection**: deterministic choice of slots to create or stop.
//! - **Restart policy**: when a crashed instance may be placed again.
//!
//! # Invariants
//!
//! - Selection is deterministic given the same inputs, regardless of order
//! - A work pool never runs more than its configured number of jobs at once

mod pool;
mod restart;
mod selection;

pub use pool::WorkPool;
pub use restart::{BackoffRestartPolicy, RestartPolicy};
pub use selection::{growth_range, select_for_stop};

use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// A work pool needs at least one worker.
    #[error("work pool requires at least one worker, got {0}")]
    InvalidWorkerCount(usize),

    /// A restart policy's parameters are inconsistent.
    #[error("invalid restart policy: {0}")]
    InvalidPolicy(String),
}
