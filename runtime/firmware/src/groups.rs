//! Device groups sharing the accelerator
//!
//! A group starts `Waiting`, becomes `Finalized` once its members are set
//! up with the firmware, and ends `Disbanded`. A firmware crash turns
//! finalized groups `Errored`: the state they set up in the firmware is
//! gone.
//!
//! While firmware loads, the registry is locked against new groups, and a
//! load is refused while any group is still alive.

use std::sync::{Arc, Mutex};

use tpu_mailbox::sync::lock;

use crate::{FirmwareError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    Waiting,
    Finalized,
    Errored,
    Disbanded,
}

#[derive(Debug)]
pub struct DeviceGroup {
    id: u32,
    status: Mutex<GroupStatus>,
}

impl DeviceGroup {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn status(&self) -> GroupStatus {
        *lock(&self.status)
    }

    /// `Waiting` -> `Finalized`; false from any other state
    pub fn finalize(&self) -> bool {
        let mut status = lock(&self.status);
        if *status != GroupStatus::Waiting {
            return false;
        }
        *status = GroupStatus::Finalized;
        true
    }

    pub fn disband(&self) {
        *lock(&self.status) = GroupStatus::Disbanded;
    }

    pub fn is_finalized(&self) -> bool {
        self.status() == GroupStatus::Finalized
    }

    pub fn is_disbanded(&self) -> bool {
        self.status() == GroupStatus::Disbanded
    }
}

#[derive(Debug, Default)]
struct Groups {
    list: Vec<Arc<DeviceGroup>>,
    next_id: u32,
    join_lockout: bool,
}

#[derive(Debug, Default)]
pub struct GroupRegistry {
    inner: Mutex<Groups>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new `Waiting` group
    ///
    /// # Errors
    /// `Busy` while firmware is loading.
    pub fn create(&self) -> Result<Arc<DeviceGroup>> {
        let mut groups = lock(&self.inner);
        if groups.join_lockout {
            return Err(FirmwareError::Busy);
        }
        let group = Arc::new(DeviceGroup {
            id: groups.next_id,
            status: Mutex::new(GroupStatus::Waiting),
        });
        groups.next_id += 1;
        groups.list.push(Arc::clone(&group));
        Ok(group)
    }

    /// Disband `group` and forget it
    pub fn remove(&self, group: &DeviceGroup) {
        group.disband();
        lock(&self.inner).list.retain(|g| g.id != group.id);
    }

    /// Lock out (`true`) or re-allow (`false`) new groups
    ///
    /// Locking fails, returning false, while a group that is not disbanded
    /// exists.
    pub fn set_join_lockout(&self, lockout: bool) -> bool {
        let mut groups = lock(&self.inner);
        if lockout && groups.list.iter().any(|g| !g.is_disbanded()) {
            return false;
        }
        groups.join_lockout = lockout;
        true
    }

    /// Mark every finalized group `Errored`; returns how many changed
    ///
    /// The group list is copied first, so no group lock is taken while
    /// the registry lock is held.
    pub fn set_errored(&self) -> usize {
        let snapshot: Vec<Arc<DeviceGroup>> = lock(&self.inner)
            .list
            .iter()
            .filter(|g| !g.is_disbanded())
            .cloned()
            .collect();
        let mut errored = 0;
        for group in snapshot {
            let mut status = lock(&group.status);
            if *status == GroupStatus::Finalized {
                *status = GroupStatus::Errored;
                errored += 1;
            }
        }
        errored
    }

    pub fn groups(&self) -> Vec<Arc<DeviceGroup>> {
        lock(&self.inner).list.clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
