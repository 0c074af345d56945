//! Desired LRP handling.
//!
//! A desired LRP declares how many instances of a process should run. The
//! reconciler persists it and keeps the actual slots in line with it.

mod reconciler;

pub use reconciler::{DesiredLrpReconciler, ReconcileOutcome};
