use std::collections::HashSet;
use std::sync::Arc;

use crate::devices::arena::{DeviceArena, DeviceLease};
use crate::models::device::{DeviceId, DeviceRole};
use crate::models::error::{Precondition, RelayError};
use crate::traits::backend::PlaybackDevice;

/// Outcome of a role assignment.
#[derive(Debug)]
pub enum RoleChange {
    /// The device moved into the requested role.
    Moved {
        /// A fresh lease for the caller to bind per-role state to.
        lease: DeviceLease,
        /// The role the device held before.
        from: DeviceRole,
        /// The previous Source, returned to Available by this change.
        demoted: Option<DeviceId>,
    },
    /// The device already held the requested role.
    Unchanged,
}

/// Devices added and dropped by a [`DeviceDirectory::refresh`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub added: Vec<DeviceId>,
    pub dropped: Vec<DeviceId>,
}

/// Leases on the Source and Targets, taken when a relay session starts.
#[derive(Debug, Default)]
pub struct Roster {
    pub source: Option<DeviceLease>,
    pub targets: Vec<DeviceLease>,
}

/// Partition of every tracked device into Available, Source and Target.
///
/// Each tracked device is held by exactly one lease in exactly one set.
/// Moves between sets happen under `&mut self` and are never observable
/// half-done.
pub struct DeviceDirectory {
    arena: DeviceArena,
    available: Vec<DeviceLease>,
    source: Option<DeviceLease>,
    targets: Vec<DeviceLease>,
}

impl DeviceDirectory {
    pub fn new(arena: DeviceArena) -> Self {
        Self {
            arena,
            available: Vec::new(),
            source: None,
            targets: Vec::new(),
        }
    }

    pub fn arena(&self) -> &DeviceArena {
        &self.arena
    }

    /// Reconcile with a fresh enumeration.
    ///
    /// New devices join Available. Available devices missing from
    /// `discovered` are released. The Source and Targets are kept even when
    /// missing.
    pub fn refresh(&mut self, discovered: Vec<Arc<dyn PlaybackDevice>>) -> RefreshSummary {
        let mut summary = RefreshSummary::default();
        let present: HashSet<DeviceId> = discovered.iter().map(|d| d.id().clone()).collect();

        let mut dropped = Vec::new();
        self.available.retain(|lease| {
            let keep = present.contains(lease.id());
            if !keep {
                dropped.push(lease.id().clone());
            }
            keep
        });
        summary.dropped = dropped;

        for device in discovered {
            if self.role_of(device.id()).is_some() {
                continue;
            }
            summary.added.push(device.id().clone());
            self.available.push(self.arena.lease(device));
        }

        if !summary.added.is_empty() || !summary.dropped.is_empty() {
            log::info!(
                "device refresh: {} added, {} dropped",
                summary.added.len(),
                summary.dropped.len()
            );
        }
        summary
    }

    /// Role currently held by `id`, or `None` if untracked.
    pub fn role_of(&self, id: &DeviceId) -> Option<DeviceRole> {
        if self.source.as_ref().is_some_and(|s| s.id() == id) {
            Some(DeviceRole::Source)
        } else if self.targets.iter().any(|t| t.id() == id) {
            Some(DeviceRole::Target)
        } else if self.available.iter().any(|a| a.id() == id) {
            Some(DeviceRole::Available)
        } else {
            None
        }
    }

    pub fn lease(&self, id: &DeviceId) -> Option<&DeviceLease> {
        self.source
            .iter()
            .chain(&self.targets)
            .chain(&self.available)
            .find(|lease| lease.id() == id)
    }

    pub fn source(&self) -> Option<&DeviceLease> {
        self.source.as_ref()
    }

    pub fn targets(&self) -> &[DeviceLease] {
        &self.targets
    }

    pub fn available(&self) -> &[DeviceLease] {
        &self.available
    }

    /// Every tracked device with its role: Source, then Targets, then Available.
    pub fn entries(&self) -> Vec<(DeviceId, DeviceRole)> {
        let source = self.source.iter().map(|l| (l.id().clone(), DeviceRole::Source));
        let targets = self.targets.iter().map(|l| (l.id().clone(), DeviceRole::Target));
        let available = self
            .available
            .iter()
            .map(|l| (l.id().clone(), DeviceRole::Available));
        source.chain(targets).chain(available).collect()
    }

    /// Make `id` the Source, demoting any previous Source to Available.
    pub fn assign_source(&mut self, id: &DeviceId) -> Result<RoleChange, RelayError> {
        if self.source.as_ref().is_some_and(|s| s.id() == id) {
            return Ok(RoleChange::Unchanged);
        }
        let (lease, from) = self.take(id).ok_or_else(|| RelayError::NotFound(id.clone()))?;

        let demoted = self.source.take().map(|previous| {
            let previous_id = previous.id().clone();
            self.available.push(previous);
            previous_id
        });

        let handle = lease.clone();
        self.source = Some(lease);
        log::info!("source set to {}", id);

        Ok(RoleChange::Moved {
            lease: handle,
            from,
            demoted,
        })
    }

    /// Add `id` to the Targets. Re-assigning an existing Target is a no-op.
    pub fn assign_target(&mut self, id: &DeviceId) -> Result<RoleChange, RelayError> {
        if self.targets.iter().any(|t| t.id() == id) {
            return Ok(RoleChange::Unchanged);
        }
        let (lease, from) = self.take(id).ok_or_else(|| RelayError::NotFound(id.clone()))?;

        let handle = lease.clone();
        self.targets.push(lease);
        log::info!("target added: {}", id);

        Ok(RoleChange::Moved {
            lease: handle,
            from,
            demoted: None,
        })
    }

    /// Return `id` from Source or Target to Available. Returns the role it left.
    pub fn release(&mut self, id: &DeviceId) -> Result<DeviceRole, RelayError> {
        match self.role_of(id) {
            None => Err(RelayError::NotFound(id.clone())),
            Some(DeviceRole::Available) => Err(RelayError::PreconditionNotMet(Precondition::NotAssigned)),
            Some(_) => {
                let (lease, from) = self.take(id).ok_or_else(|| RelayError::NotFound(id.clone()))?;
                self.available.push(lease);
                log::info!("{} returned to available (was {})", id, from);
                Ok(from)
            }
        }
    }

    /// Return every Target to Available. Returns the ids moved.
    pub fn clear_targets(&mut self) -> Result<Vec<DeviceId>, RelayError> {
        if self.targets.is_empty() {
            return Err(RelayError::PreconditionNotMet(Precondition::NothingToClear));
        }
        let cleared: Vec<DeviceId> = self.targets.iter().map(|t| t.id().clone()).collect();
        self.available.append(&mut self.targets);
        log::info!("cleared {} targets", cleared.len());
        Ok(cleared)
    }

    /// Acquire leases on the Source and every Target for a relay session.
    pub fn roster(&self) -> Roster {
        Roster {
            source: self.source.clone(),
            targets: self.targets.clone(),
        }
    }

    /// Release every tracked device: Targets, then Source, then Available.
    pub fn clear(&mut self) {
        while let Some(target) = self.targets.pop() {
            drop(target);
        }
        self.source = None;
        self.available.clear();
    }

    fn take(&mut self, id: &DeviceId) -> Option<(DeviceLease, DeviceRole)> {
        if self.source.as_ref().is_some_and(|s| s.id() == id) {
            return self.source.take().map(|l| (l, DeviceRole::Source));
        }
        if let Some(pos) = self.targets.iter().position(|t| t.id() == id) {
            return Some((self.targets.remove(pos), DeviceRole::Target));
        }
        if let Some(pos) = self.available.iter().position(|a| a.id() == id) {
            return Some((self.available.remove(pos), DeviceRole::Available));
        }
        None
    }
}
