//! Bounded-concurrency work pool.

use std::future::Future;
use std::num::NonZeroUsize;

use futures_util::stream::{self, StreamExt};

use crate::ReconcileError;

/// Runs a batch of jobs with at most `max_workers` in flight.
///
/// A pool is cheap to build; callers typically create one per
/// reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkPool {
    max_workers: NonZeroUsize,
}

impl WorkPool {
    pub fn new(max_workers: usize) -> Result<Self, ReconcileError> {
        NonZeroUsize::new(max_workers)
            .map(|max_workers| Self { max_workers })
            .ok_or(ReconcileError::InvalidWorkerCount(max_workers))
    }

    /// Runs `job` for every item and collects the results.
    ///
    /// Results arrive in completion order, not input order. A failing job
    /// does not stop the others; encode failures in `T`.
    pub async fn run<I, F, Fut, T>(&self, items: I, job: F) -> Vec<T>
    where
        I: IntoIterator,
        F: FnMut(I::Item) -> Fut,
        Fut: Future<Output = T>,
    {
        stream::iter(items)
            .map(job)
            .buffer_unordered(self.max_workers.get())
            .collect()
            .await
    }
}
