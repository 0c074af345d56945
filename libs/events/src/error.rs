//! Error types for models and the event hub.

use thiserror::Error;

/// Errors returned by [`EventHub`](crate::EventHub) and
/// [`Subscription`](crate::Subscription).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HubError {
    /// The subscriber fell behind and was evicted by the hub.
    #[error("subscriber evicted: delivery queue overflowed")]
    SlowConsumer,

    /// The hub was closed while the subscription was live.
    #[error("event hub closed")]
    HubClosed,

    /// The subscription was closed by its owner.
    #[error("read from closed event source")]
    ReadFromClosedSource,

    /// The subscription was already closed.
    #[error("event source already closed")]
    SourceAlreadyClosed,

    /// Subscribe was called after the hub closed.
    #[error("subscribed to closed hub")]
    SubscribedToClosedHub,

    /// Close was called twice on the hub.
    #[error("hub already closed")]
    HubAlreadyClosed,
}

impl HubError {
    /// Returns true if the error ends the subscription for good.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::SlowConsumer | Self::HubClosed | Self::ReadFromClosedSource
        )
    }
}

/// A model failed validation before any state was mutated.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid {field}: {message}")]
pub struct ValidationError {
    /// Offending field.
    pub field: &'static str,
    /// What is wrong with it.
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl From<lrp_id::IdError> for ValidationError {
    fn from(err: lrp_id::IdError) -> Self {
        Self::new("identifier", err.to_string())
    }
}
