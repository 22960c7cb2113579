use serde::Serialize;

use super::device::{DeviceId, DeviceInfo};
use super::format::StreamFormat;
use super::state::RelayState;

/// Per-target delivery figures for the running session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetDiagnostics {
    pub id: DeviceId,
    pub packets_delivered: u64,
    /// Packets skipped because the target's buffer lacked space.
    pub packets_dropped: u64,
    pub write_errors: u64,
}

/// Snapshot of a running relay session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayDiagnostics {
    pub session_id: String,
    /// RFC 3339 start time.
    pub started_at: String,
    pub source: DeviceId,
    pub format: StreamFormat,
    pub packets_captured: u64,
    pub frames_captured: u64,
    /// Packets the capture endpoint flagged as following a glitch.
    pub discontinuities: u64,
    /// The relay loop stopped on its own after a capture failure.
    pub faulted: bool,
    pub targets: Vec<TargetDiagnostics>,
}

/// Everything a front-end needs to render the relay.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayStatus {
    pub state: RelayState,
    pub global_volume: f32,
    pub source: Option<DeviceInfo>,
    pub targets: Vec<DeviceInfo>,
    pub available: Vec<DeviceInfo>,
    pub diagnostics: Option<RelayDiagnostics>,
}
