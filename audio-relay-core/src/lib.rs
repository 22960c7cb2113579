//! # audio-relay-core
//!
//! Platform-agnostic audio relay core library.
//!
//! Captures what one playback device is rendering (loopback) and copies it,
//! packet by packet, into any number of other playback devices, each with its
//! own volume under a global multiplier. Platform backends (Windows WASAPI)
//! implement the `AudioBackend` trait and plug into the generic `AudioRelay`.
//!
//! ## Architecture
//!
//! ```text
//! audio-relay-core (this crate)
//! ├── traits/    ← AudioBackend, PlaybackDevice, Capture/RenderEndpoint, VolumeControl, RelayDelegate
//! ├── models/    ← RelayError, RelayState, RelayConfiguration, DeviceId, StreamFormat, diagnostics
//! ├── devices/   ← DeviceArena + DeviceLease, DeviceDirectory (Available / Source / Target)
//! ├── volume/    ← effective-volume model, VolumeController
//! ├── engine/    ← RelayEngine and the real-time relay loop
//! └── session/   ← AudioRelay (one explicit context per relay)
//! ```

pub mod devices;
pub mod engine;
pub mod models;
pub mod session;
pub mod traits;
pub mod volume;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

// Re-export key types at crate root for convenience.
pub use devices::arena::{DeviceArena, DeviceLease};
pub use devices::directory::{DeviceDirectory, RefreshSummary, RoleChange, Roster};
pub use engine::RelayEngine;
pub use models::config::RelayConfiguration;
pub use models::device::{DeviceId, DeviceInfo, DeviceRole};
pub use models::diagnostics::{RelayDiagnostics, RelayStatus, TargetDiagnostics};
pub use models::error::{Capability, Precondition, RelayError};
pub use models::format::{PacketFlags, SampleEncoding, StreamFormat};
pub use models::state::RelayState;
pub use session::relay::AudioRelay;
pub use traits::backend::{AudioBackend, PlaybackDevice, ThreadGuard};
pub use traits::delegate::RelayDelegate;
pub use traits::endpoint::{CaptureEndpoint, CapturedPacket, RenderEndpoint, VolumeControl};
pub use volume::controller::VolumeController;
