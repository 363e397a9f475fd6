//! Device registry
//!
//! Slab-style storage for device records, indexed by opaque handles. Handles
//! carry a generation counter so that a handle kept around after `delete`
//! is rejected instead of silently addressing a reused slot.

use crate::device::DeviceRecord;
use crate::error::{CdcError, Result};
use std::sync::Arc;

/// Opaque handle to a created CDC device.
///
/// Copyable and cheap; all operations go through the driver. After the
/// device is deleted the handle goes stale and every use fails with an
/// invalid-argument error, even if its slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CdcHandle {
    index: u32,
    generation: u32,
}

struct Slot {
    generation: u32,
    record: Option<Arc<DeviceRecord>>,
}

pub(crate) struct Registry {
    slots: Vec<Slot>,
    live: usize,
    max_devices: usize,
}

impl Registry {
    pub fn new(max_devices: usize) -> Self {
        Self {
            slots: Vec::new(),
            live: 0,
            max_devices,
        }
    }

    pub fn live(&self) -> usize {
        self.live
    }

    pub fn is_full(&self) -> bool {
        self.live >= self.max_devices
    }

    /// Insert a record built around its own handle.
    pub fn insert(
        &mut self,
        make: impl FnOnce(CdcHandle) -> Arc<DeviceRecord>,
    ) -> Result<Arc<DeviceRecord>> {
        if self.is_full() {
            return Err(CdcError::NoMem("device limit reached"));
        }
        let index = match self.slots.iter().position(|s| s.record.is_none()) {
            Some(i) => i,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    record: None,
                });
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[index];
        let handle = CdcHandle {
            index: index as u32,
            generation: slot.generation,
        };
        let record = make(handle);
        slot.record = Some(record.clone());
        self.live += 1;
        Ok(record)
    }

    pub fn get(&self, handle: CdcHandle) -> Option<Arc<DeviceRecord>> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.record.clone()
    }

    /// Remove a record, invalidating its handle.
    pub fn remove(&mut self, handle: CdcHandle) -> Result<Arc<DeviceRecord>> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .ok_or(CdcError::InvalidArg("stale device handle"))?;
        if slot.generation != handle.generation {
            return Err(CdcError::InvalidArg("stale device handle"));
        }
        let record = slot
            .record
            .take()
            .ok_or(CdcError::InvalidArg("stale device handle"))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.live -= 1;
        Ok(record)
    }

    pub fn records(&self) -> impl Iterator<Item = &Arc<DeviceRecord>> {
        self.slots.iter().filter_map(|s| s.record.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;

    fn make_record(handle: CdcHandle) -> Arc<DeviceRecord> {
        let (events, _rx) = async_channel::bounded(8);
        Arc::new(DeviceRecord::new(handle, &DeviceConfig::default(), events))
    }

    #[test]
    fn test_insert_and_get() {
        let mut registry = Registry::new(4);
        let record = registry.insert(make_record).unwrap();
        let handle = record.handle;

        assert_eq!(registry.live(), 1);
        assert!(registry.get(handle).is_some());
    }

    #[test]
    fn test_stale_handle_rejected() {
        let mut registry = Registry::new(4);
        let handle = registry.insert(make_record).unwrap().handle;

        registry.remove(handle).unwrap();
        assert!(registry.get(handle).is_none());
        assert!(matches!(
            registry.remove(handle),
            Err(CdcError::InvalidArg(_))
        ));
    }

    #[test]
    fn test_slot_reuse_bumps_generation() {
        let mut registry = Registry::new(4);
        let old = registry.insert(make_record).unwrap().handle;
        registry.remove(old).unwrap();

        let new = registry.insert(make_record).unwrap().handle;
        assert_ne!(old, new);
        assert!(registry.get(old).is_none());
        assert!(registry.get(new).is_some());
    }

    #[test]
    fn test_capacity_bound() {
        let mut registry = Registry::new(2);
        let first = registry.insert(make_record).unwrap().handle;
        registry.insert(make_record).unwrap();

        assert!(matches!(
            registry.insert(make_record),
            Err(CdcError::NoMem(_))
        ));

        // Removing one frees a slot again
        registry.remove(first).unwrap();
        assert!(registry.insert(make_record).is_ok());
    }
}
