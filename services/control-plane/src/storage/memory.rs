//! In-memory storage backend.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use lrp_events::{
    ActualLrp, ActualLrpFilter, ActualLrpGroup, ActualLrpInstanceKey, ActualLrpKey,
    DesiredLrpFilter, DesiredLrpSchedulingInfo, ModificationTag, Presence,
};
use lrp_id::ProcessGuid;
use tokio::sync::RwLock;

use super::{Storage, StoreError};

type SlotKey = (ProcessGuid, u32);

#[derive(Default)]
struct Tables {
    desired: BTreeMap<ProcessGuid, DesiredLrpSchedulingInfo>,
    actual: BTreeMap<SlotKey, ActualLrpGroup>,
}

/// A [`Storage`] kept entirely in process memory.
///
/// Honours the same create-if-absent and conditional-write rules a durable
/// backend would. [`MemoryStore::set_failing`] makes every call fail with
/// [`StoreError::Unrecoverable`].
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unrecoverable(
                "storage backend unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

fn slot_key(key: &ActualLrpKey) -> SlotKey {
    (key.process_guid.clone(), key.index)
}

fn slot_mut(group: &mut ActualLrpGroup, presence: Presence) -> &mut Option<ActualLrp> {
    match presence {
        Presence::Ordinary => &mut group.instance,
        Presence::Evacuating => &mut group.evacuating,
    }
}

fn describe(key: &ActualLrpKey, presence: Presence) -> String {
    match presence {
        Presence::Ordinary => format!("actual lrp {key}"),
        Presence::Evacuating => format!("evacuating actual lrp {key}"),
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn create_desired_lrp(
        &self,
        desired: &DesiredLrpSchedulingInfo,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        if tables.desired.contains_key(&desired.process_guid) {
            return Err(StoreError::AlreadyExists(format!(
                "desired lrp {}",
                desired.process_guid
            )));
        }
        tables
            .desired
            .insert(desired.process_guid.clone(), desired.clone());
        Ok(())
    }

    async fn desired_lrp(
        &self,
        process_guid: &ProcessGuid,
    ) -> Result<DesiredLrpSchedulingInfo, StoreError> {
        self.check()?;
        self.tables
            .read()
            .await
            .desired
            .get(process_guid)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("desired lrp {process_guid}")))
    }

    async fn desired_lrps(
        &self,
        filter: &DesiredLrpFilter,
    ) -> Result<Vec<DesiredLrpSchedulingInfo>, StoreError> {
        self.check()?;
        Ok(self
            .tables
            .read()
            .await
            .desired
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect())
    }

    async fn update_desired_lrp(
        &self,
        expected: &ModificationTag,
        desired: &DesiredLrpSchedulingInfo,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let what = format!("desired lrp {}", desired.process_guid);
        let stored = tables
            .desired
            .get_mut(&desired.process_guid)
            .ok_or_else(|| StoreError::NotFound(what.clone()))?;
        if stored.modification_tag != *expected {
            return Err(StoreError::Conflict(what));
        }
        *stored = desired.clone();
        Ok(())
    }

    async fn remove_desired_lrp(
        &self,
        process_guid: &ProcessGuid,
    ) -> Result<DesiredLrpSchedulingInfo, StoreError> {
        self.check()?;
        self.tables
            .write()
            .await
            .desired
            .remove(process_guid)
            .ok_or_else(|| StoreError::NotFound(format!("desired lrp {process_guid}")))
    }

    async fn actual_lrp_group(
        &self,
        process_guid: &ProcessGuid,
        index: u32,
    ) -> Result<ActualLrpGroup, StoreError> {
        self.check()?;
        self.tables
            .read()
            .await
            .actual
            .get(&(process_guid.clone(), index))
            .filter(|g| !g.is_empty())
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("actual lrp {process_guid}/{index}")))
    }

    async fn actual_lrp_groups(
        &self,
        filter: &ActualLrpFilter,
    ) -> Result<Vec<ActualLrpGroup>, StoreError> {
        self.check()?;
        let tables = self.tables.read().await;
        let groups = match &filter.process_guid {
            Some(guid) => tables
                .actual
                .range((guid.clone(), 0)..=(guid.clone(), u32::MAX))
                .filter_map(|(_, g)| filter.apply(g))
                .collect(),
            None => tables
                .actual
                .values()
                .filter_map(|g| filter.apply(g))
                .collect(),
        };
        Ok(groups)
    }

    async fn create_actual_lrp(
        &self,
        presence: Presence,
        lrp: &ActualLrp,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let group = tables.actual.entry(slot_key(&lrp.key)).or_default();
        let slot = slot_mut(group, presence);
        if slot.is_some() {
            return Err(StoreError::AlreadyExists(describe(&lrp.key, presence)));
        }
        *slot = Some(lrp.clone());
        Ok(())
    }

    async fn update_actual_lrp(
        &self,
        presence: Presence,
        expected: &ModificationTag,
        lrp: &ActualLrp,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let what = describe(&lrp.key, presence);
        let stored = tables
            .actual
            .get_mut(&slot_key(&lrp.key))
            .and_then(|g| slot_mut(g, presence).as_mut())
            .ok_or_else(|| StoreError::NotFound(what.clone()))?;
        if stored.modification_tag != *expected {
            return Err(StoreError::Conflict(what));
        }
        *stored = lrp.clone();
        Ok(())
    }

    async fn remove_actual_lrp(
        &self,
        presence: Presence,
        key: &ActualLrpKey,
        instance_key: Option<&ActualLrpInstanceKey>,
    ) -> Result<ActualLrp, StoreError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let what = describe(key, presence);
        let id = slot_key(key);
        let group = tables
            .actual
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(what.clone()))?;
        let slot = slot_mut(group, presence);
        match (slot.as_ref(), instance_key) {
            (None, _) => return Err(StoreError::NotFound(what)),
            (Some(stored), Some(ik)) if !stored.is_owned_by(ik) => {
                return Err(StoreError::Conflict(what))
            }
            _ => {}
        }
        let removed = slot.take().ok_or(StoreError::NotFound(what))?;
        if group.is_empty() {
            tables.actual.remove(&id);
        }
        Ok(removed)
    }
}
