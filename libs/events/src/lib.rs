//! # lrp-events
//!
//! Models and change events for desired and actual long-running processes,
//! plus the in-process hub that fans those events out to subscribers.
//!
//! ## Design Principles
//!
//! - Events are immutable records of committed state transitions
//! - Every event carries full before/after snapshots, never deltas
//! - The set of event kinds is closed; consumers match exhaustively
//! - Publishing never blocks: a subscriber that cannot keep up is evicted
//!
//! ## Event Kinds
//!
//! - Desired LRP events (`desired_lrp.created`, `desired_lrp.changed`,
//!   `desired_lrp.removed`)
//! - Actual LRP events (`actual_lrp.created`, `actual_lrp.changed`,
//!   `actual_lrp.removed`, `actual_lrp.crashed`)

mod error;
mod event;
mod filter;
mod hub;
mod types;

pub use error::{HubError, ValidationError};
pub use event::*;
pub use filter::EventFilter;
pub use hub::{EventHub, Subscription, DEFAULT_MAX_PENDING_EVENTS};
pub use types::*;
