//! Error types for LRP operations.

use lrp_events::{ActualLrpKey, ActualLrpState, HubError, ValidationError};
use lrp_reconcile::ReconcileError;
use thiserror::Error;

use crate::storage::StoreError;

/// Broad classification callers use to decide what to do with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request was malformed; nothing was written.
    Validation,
    /// The request lost a race or violates the lifecycle graph.
    Conflict,
    /// The target record does not exist.
    NotFound,
    /// Storage failed in a way that requires the process to restart.
    Unrecoverable,
}

/// Errors returned by lifecycle, evacuation and reconciliation operations.
#[derive(Debug, Error)]
pub enum LrpError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A record with the same key already exists.
    #[error("{0} already exists")]
    ResourceExists(String),

    #[error("{0} not found")]
    NotFound(String),

    /// The requested transition is not in the lifecycle graph.
    #[error("actual lrp {key} cannot transition from {from} to {to}")]
    CannotTransition {
        key: ActualLrpKey,
        from: ActualLrpState,
        to: ActualLrpState,
    },

    /// The record is owned by a different instance.
    #[error("actual lrp {0} is owned by a different instance")]
    InstanceMismatch(ActualLrpKey),

    /// The record changed between read and write.
    #[error("stale write: {0}")]
    StaleRecord(String),

    #[error("unrecoverable storage error: {0}")]
    Unrecoverable(String),

    #[error("invalid reconciler configuration: {0}")]
    Config(#[from] ReconcileError),
}

impl LrpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::Config(_) => ErrorKind::Validation,
            Self::ResourceExists(_)
            | Self::CannotTransition { .. }
            | Self::InstanceMismatch(_)
            | Self::StaleRecord(_) => ErrorKind::Conflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Unrecoverable(_) => ErrorKind::Unrecoverable,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }
}

impl From<StoreError> for LrpError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::AlreadyExists(what) => Self::ResourceExists(what),
            StoreError::Conflict(what) => Self::StaleRecord(what),
            StoreError::Unrecoverable(msg) => Self::Unrecoverable(msg),
        }
    }
}

/// Errors that end an outbound event stream.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("event source failed: {0}")]
    Hub(#[from] HubError),

    #[error("failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),
}
