//! # lrp-id
//!
//! Typed identifiers for desired and actual long-running processes (LRPs).
//!
//! ## Identifier Kinds
//!
//! Two families of identifiers live here:
//!
//! - **Generated IDs** use a prefixed ULID format: `{prefix}_{ulid}`, e.g.
//!   `ig_01HV4Z4NYPLTRS0JTUA8XDME5F` for an instance guid. They are created by
//!   the system and are time-sortable.
//! - **Names** are caller-supplied strings (process guids, cell ids, domains).
//!   They are validated once at construction and are opaque afterwards.
//!
//! Both families are typed so a cell id can never be passed where a process
//! guid is expected.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
