use std::fmt;

use serde::Serialize;

/// Stable identity of a playback endpoint.
///
/// On Windows this is the MMDevice endpoint ID string, which persists for the
/// same physical device across enumerations and reboots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The role a tracked device currently holds. Every tracked device holds exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    Available,
    Source,
    Target,
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Available => "available",
            Self::Source => "source",
            Self::Target => "target",
        };
        f.write_str(name)
    }
}

/// A tracked device as presented to front-ends.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
    pub role: DeviceRole,
    /// Per-device volume factor; only Targets carry one. Above 1.0 when the
    /// device was louder than the global volume on becoming a Target.
    pub individual_volume: Option<f32>,
    /// `global * individual`, clamped; only Targets carry one.
    pub effective_volume: Option<f32>,
    pub has_volume_control: bool,
}
