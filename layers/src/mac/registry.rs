//! UE Registry
//!
//! Bounded table of connected UEs. A UE's uid is its slot in the table, so
//! ids are stable for the lifetime of the UE and the lowest free id is
//! reused after a detach.

use common::types::Rnti;
use tracing::{debug, warn};

use super::ue::UeInfo;
use super::MacError;

/// Table of connected UEs
#[derive(Debug)]
pub struct UeRegistry {
    slots: Vec<Option<Box<UeInfo>>>,
    len: usize,
}

impl UeRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Change the capacity. Fails if a UE occupies a slot beyond it.
    pub fn resize(&mut self, capacity: usize) -> Result<(), MacError> {
        if let Some(uid) = self.slots.iter().skip(capacity).position(Option::is_some) {
            return Err(MacError::InvalidConfiguration(format!(
                "cannot shrink UE registry to {} while uid {} is attached",
                capacity,
                capacity + uid
            )));
        }
        self.slots.resize_with(capacity, || None);
        Ok(())
    }

    /// Insert a UE and issue its uid
    pub fn attach(&mut self, mut ue: UeInfo) -> Result<u16, MacError> {
        if self.contains(ue.rnti) {
            warn!("UE {} attached twice", ue.rnti);
            return Err(MacError::DuplicateRnti(ue.rnti));
        }
        let Some(uid) = self.slots.iter().position(Option::is_none) else {
            warn!("UE registry full ({}), rejecting {}", self.capacity(), ue.rnti);
            return Err(MacError::RegistryFull(self.capacity()));
        };
        ue.uid = uid as u16;
        debug!("UE {} attached with uid {}", ue.rnti, uid);
        self.slots[uid] = Some(Box::new(ue));
        self.len += 1;
        Ok(uid as u16)
    }

    /// Remove the UE with `uid`
    pub fn detach(&mut self, uid: u16) -> Option<Box<UeInfo>> {
        let ue = self.slots.get_mut(uid as usize)?.take()?;
        self.len -= 1;
        debug!("UE {} detached from uid {}", ue.rnti, uid);
        Some(ue)
    }

    pub fn uid_of(&self, rnti: Rnti) -> Option<u16> {
        self.iter().find(|ue| ue.rnti == rnti).map(|ue| ue.uid)
    }

    pub fn contains(&self, rnti: Rnti) -> bool {
        self.uid_of(rnti).is_some()
    }

    pub fn get(&self, rnti: Rnti) -> Option<&UeInfo> {
        self.iter().find(|ue| ue.rnti == rnti)
    }

    pub fn get_mut(&mut self, rnti: Rnti) -> Option<&mut UeInfo> {
        self.iter_mut().find(|ue| ue.rnti == rnti)
    }

    pub fn by_uid(&self, uid: u16) -> Option<&UeInfo> {
        self.slots.get(uid as usize)?.as_deref()
    }

    pub fn by_uid_mut(&mut self, uid: u16) -> Option<&mut UeInfo> {
        self.slots.get_mut(uid as usize)?.as_deref_mut()
    }

    /// UEs in table order, skipping empty slots
    pub fn iter(&self) -> impl Iterator<Item = &UeInfo> {
        self.slots.iter().filter_map(|slot| slot.as_deref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut UeInfo> {
        self.slots.iter_mut().filter_map(|slot| slot.as_deref_mut())
    }

    /// Visit every UE in table order
    pub fn for_each<F: FnMut(&mut UeInfo)>(&mut self, visitor: F) {
        self.iter_mut().for_each(visitor);
    }
}
