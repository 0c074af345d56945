//! LRP control plane library.
//!
//! This crate primarily ships the `lrp-control-plane` binary, but exposes
//! its controllers, stores and collaborator seams for integration testing
//! and embedding.

pub mod actual;
pub mod api;
pub mod collaborators;
pub mod config;
pub mod desired;
pub mod emitter;
pub mod error;
#[cfg(any(test, feature = "test-support"))]
pub mod fakes;
pub mod state;
pub mod storage;
pub mod stream;

#[cfg(test)]
mod test_support;
