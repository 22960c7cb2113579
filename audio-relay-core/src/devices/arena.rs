use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::models::device::DeviceId;
use crate::traits::backend::PlaybackDevice;

struct Slot {
    device: Arc<dyn PlaybackDevice>,
    leases: usize,
}

type Slots = Mutex<HashMap<DeviceId, Slot>>;

/// Central registry of playback devices, keyed by stable identity.
///
/// Components never hold a device directly; they hold a [`DeviceLease`].
/// A device stays registered while at least one lease is alive and is
/// dropped (releasing its native handle) together with the last lease.
///
/// Cloning the arena yields another handle to the same registry.
#[derive(Clone, Default)]
pub struct DeviceArena {
    slots: Arc<Slots>,
}

impl DeviceArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a lease on `device`.
    ///
    /// If a device with the same identity is already registered, the existing
    /// registration is reused and `device` is discarded.
    pub fn lease(&self, device: Arc<dyn PlaybackDevice>) -> DeviceLease {
        let id = device.id().clone();
        let mut slots = self.slots.lock();
        let slot = slots
            .entry(id.clone())
            .or_insert_with(|| Slot { device, leases: 0 });
        slot.leases += 1;
        log::debug!("lease acquired on {} ({} held)", id, slot.leases);

        DeviceLease {
            device: Arc::clone(&slot.device),
            id,
            arena: Arc::downgrade(&self.slots),
        }
    }

    /// Number of live leases on `id`; 0 if the device is not registered.
    pub fn lease_count(&self, id: &DeviceId) -> usize {
        self.slots.lock().get(id).map_or(0, |s| s.leases)
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.slots.lock().contains_key(id)
    }

    /// Number of registered devices.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

/// A counted reference to a registered device.
///
/// `clone()` acquires another lease and dropping releases it, so every
/// acquire is balanced by exactly one release.
pub struct DeviceLease {
    id: DeviceId,
    device: Arc<dyn PlaybackDevice>,
    arena: Weak<Slots>,
}

impl DeviceLease {
    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn device(&self) -> &dyn PlaybackDevice {
        self.device.as_ref()
    }
}

impl Clone for DeviceLease {
    fn clone(&self) -> Self {
        if let Some(registry) = self.arena.upgrade() {
            if let Some(slot) = registry.lock().get_mut(&self.id) {
                slot.leases += 1;
            }
        }
        Self {
            id: self.id.clone(),
            device: Arc::clone(&self.device),
            arena: Weak::clone(&self.arena),
        }
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        let Some(registry) = self.arena.upgrade() else {
            return;
        };
        let mut slots = registry.lock();
        let Some(slot) = slots.get_mut(&self.id) else {
            return;
        };
        slot.leases -= 1;
        if slot.leases == 0 {
            slots.remove(&self.id);
            log::debug!("released last lease on {}", self.id);
        }
    }
}

impl PartialEq for DeviceLease {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DeviceLease {}

impl fmt::Debug for DeviceLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DeviceLease").field(&self.id).finish()
    }
}
