use std::collections::HashMap;

use crate::devices::arena::DeviceLease;
use crate::models::device::DeviceId;
use crate::models::error::{Capability, RelayError};
use crate::traits::endpoint::VolumeControl;
use crate::volume::model::{clamp_unit, effective_volume, initial_individual_volume};

struct VolumeEntry {
    // Keeps the device registered while its volume control is bound.
    _lease: DeviceLease,
    control: Option<Box<dyn VolumeControl>>,
    individual: f32,
}

/// Per-Target volume state bound to each device's native volume control.
///
/// Only touches the volume control, never a render buffer, so every method
/// is safe to call while a relay session is running.
pub struct VolumeController {
    global: f32,
    entries: HashMap<DeviceId, VolumeEntry>,
}

impl VolumeController {
    pub fn new(global: f32) -> Self {
        Self {
            global: clamp_unit(global),
            entries: HashMap::new(),
        }
    }

    pub fn global_volume(&self) -> f32 {
        self.global
    }

    /// Bind a new Target.
    ///
    /// Acquires the device's volume control if it has one, derives the
    /// individual volume from its current native level so the audible level
    /// does not jump, and pushes the effective volume. Returns the individual volume.
    pub fn attach(&mut self, lease: DeviceLease) -> f32 {
        let id = lease.id().clone();
        let control = match lease.device().volume_control() {
            Ok(control) => Some(control),
            Err(e) => {
                log::warn!("{}; per-device volume disabled", e);
                None
            }
        };

        let individual = match control.as_ref().map(|c| c.scalar_volume()) {
            Some(Ok(native)) => initial_individual_volume(native, self.global),
            Some(Err(e)) => {
                log::warn!("failed to read volume of {}: {}", id, e);
                1.0
            }
            None => 1.0,
        };

        let entry = VolumeEntry {
            _lease: lease,
            control,
            individual,
        };
        Self::push(&id, &entry, self.global);
        self.entries.insert(id, entry);
        individual
    }

    /// Unbind a Target, releasing its volume control. Returns whether it was bound.
    pub fn detach(&mut self, id: &DeviceId) -> bool {
        self.entries.remove(id).is_some()
    }

    pub fn detach_all(&mut self) {
        self.entries.clear();
    }

    /// Set the global multiplier and re-apply it to every Target. Returns the stored value.
    pub fn set_global_volume(&mut self, volume: f32) -> f32 {
        self.global = clamp_unit(volume);
        for (id, entry) in &self.entries {
            Self::push(id, entry, self.global);
        }
        self.global
    }

    /// Set one Target's individual volume. Returns the effective volume.
    ///
    /// A Target without a volume control stores the value and reports
    /// [`RelayError::CapabilityUnavailable`].
    pub fn set_device_volume(&mut self, id: &DeviceId, volume: f32) -> Result<f32, RelayError> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| RelayError::NotFound(id.clone()))?;
        entry.individual = clamp_unit(volume);

        let effective = Self::push(id, entry, self.global);
        if entry.control.is_none() {
            return Err(RelayError::CapabilityUnavailable {
                device: id.clone(),
                capability: Capability::VolumeControl,
            });
        }
        Ok(effective)
    }

    pub fn individual_volume(&self, id: &DeviceId) -> Option<f32> {
        self.entries.get(id).map(|e| e.individual)
    }

    pub fn effective_volume(&self, id: &DeviceId) -> Option<f32> {
        self.entries
            .get(id)
            .map(|e| effective_volume(self.global, e.individual))
    }

    pub fn has_control(&self, id: &DeviceId) -> bool {
        self.entries.get(id).is_some_and(|e| e.control.is_some())
    }

    fn push(id: &DeviceId, entry: &VolumeEntry, global: f32) -> f32 {
        let effective = effective_volume(global, entry.individual);
        if let Some(control) = &entry.control {
            if let Err(e) = control.set_scalar_volume(effective) {
                log::warn!("failed to set volume of {}: {}", id, e);
            }
        }
        effective
    }
}
