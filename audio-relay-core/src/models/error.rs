use thiserror::Error;

use super::device::DeviceId;

/// Errors reported by directory, volume and engine operations.
///
/// None of these are fatal to the process. The caller decides how to surface them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("device not found: {0}")]
    NotFound(DeviceId),

    #[error("{device} has no {capability}")]
    CapabilityUnavailable { device: DeviceId, capability: Capability },

    #[error("failed to activate {device}: {reason}")]
    ActivationFailure { device: DeviceId, reason: String },

    #[error("{0}")]
    PreconditionNotMet(Precondition),

    #[error("configuration failed: {0}")]
    ConfigurationFailed(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl RelayError {
    pub fn activation(device: &DeviceId, reason: impl Into<String>) -> Self {
        Self::ActivationFailure {
            device: device.clone(),
            reason: reason.into(),
        }
    }

    pub fn backend(reason: impl Into<String>) -> Self {
        Self::Backend(reason.into())
    }
}

/// Optional native capabilities a device may lack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    VolumeControl,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VolumeControl => f.write_str("endpoint volume control"),
        }
    }
}

/// Why an operation was a no-op.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    #[error("no source device set")]
    NoSource,

    #[error("no target devices set")]
    NoTargets,

    #[error("relay is already running")]
    AlreadyRunning,

    #[error("nothing to do: no target devices")]
    NothingToClear,

    #[error("device holds neither the source nor a target role")]
    NotAssigned,

    #[error("source device is in use by the running relay")]
    SourceInUse,
}
