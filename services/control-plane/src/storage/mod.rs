//! Storage abstraction for desired and actual LRP records.
//!
//! Writes are either create-if-absent or conditional on what the caller last
//! read, so concurrent writers lose with [`StoreError::Conflict`] instead of
//! overwriting each other.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use lrp_events::{
    ActualLrp, ActualLrpFilter, ActualLrpGroup, ActualLrpInstanceKey, ActualLrpKey,
    DesiredLrpFilter, DesiredLrpSchedulingInfo, ModificationTag, Presence,
};
use lrp_id::ProcessGuid;
use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    /// A conditional write found a different record than expected.
    #[error("conditional write failed for {0}")]
    Conflict(String),

    /// The backend cannot continue.
    #[error("{0}")]
    Unrecoverable(String),
}

impl StoreError {
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Unrecoverable(_))
    }
}

/// Durable record storage.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    // Desired LRPs

    /// Fails with `AlreadyExists` if the process guid is taken.
    async fn create_desired_lrp(&self, desired: &DesiredLrpSchedulingInfo)
        -> Result<(), StoreError>;

    async fn desired_lrp(&self, process_guid: &ProcessGuid)
        -> Result<DesiredLrpSchedulingInfo, StoreError>;

    async fn desired_lrps(
        &self,
        filter: &DesiredLrpFilter,
    ) -> Result<Vec<DesiredLrpSchedulingInfo>, StoreError>;

    /// Replaces the record if its stored tag still equals `expected`.
    async fn update_desired_lrp(
        &self,
        expected: &ModificationTag,
        desired: &DesiredLrpSchedulingInfo,
    ) -> Result<(), StoreError>;

    /// Removes and returns the record.
    async fn remove_desired_lrp(
        &self,
        process_guid: &ProcessGuid,
    ) -> Result<DesiredLrpSchedulingInfo, StoreError>;

    // Actual LRPs

    /// Fails with `NotFound` when neither record exists for the slot.
    async fn actual_lrp_group(
        &self,
        process_guid: &ProcessGuid,
        index: u32,
    ) -> Result<ActualLrpGroup, StoreError>;

    /// Groups ordered by process guid, then index.
    async fn actual_lrp_groups(
        &self,
        filter: &ActualLrpFilter,
    ) -> Result<Vec<ActualLrpGroup>, StoreError>;

    /// Fails with `AlreadyExists` if the slot already holds a record of the
    /// given presence.
    async fn create_actual_lrp(&self, presence: Presence, lrp: &ActualLrp)
        -> Result<(), StoreError>;

    /// Replaces the record if its stored tag still equals `expected`.
    async fn update_actual_lrp(
        &self,
        presence: Presence,
        expected: &ModificationTag,
        lrp: &ActualLrp,
    ) -> Result<(), StoreError>;

    /// Removes and returns the record. When `instance_key` is given the
    /// stored record must be owned by it.
    async fn remove_actual_lrp(
        &self,
        presence: Presence,
        key: &ActualLrpKey,
        instance_key: Option<&ActualLrpInstanceKey>,
    ) -> Result<ActualLrp, StoreError>;
}
