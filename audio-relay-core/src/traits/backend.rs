use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use crate::models::device::DeviceId;
use crate::models::error::RelayError;
use crate::models::format::StreamFormat;
use crate::traits::endpoint::{CaptureEndpoint, RenderEndpoint, VolumeControl};

/// Per-thread state set up by [`AudioBackend::enter_relay_thread`].
///
/// Dropped on the relay thread when the loop exits.
pub type ThreadGuard = Box<dyn Any>;

/// Platform audio subsystem: enumerates playback endpoints.
///
/// Implemented by:
/// - `WasapiBackend` (Windows)
/// - `MockBackend` (tests)
pub trait AudioBackend: Send + Sync {
    /// List every currently active render endpoint.
    ///
    /// Must be callable repeatedly and return the same [`DeviceId`] for the
    /// same physical device across calls.
    fn list_active_render_endpoints(&self) -> Result<Vec<Arc<dyn PlaybackDevice>>, RelayError>;

    /// Prepare the calling thread to run the relay loop.
    ///
    /// When `elevate_priority` is set, request real-time scheduling. Failure
    /// to elevate is not an error.
    fn enter_relay_thread(&self, elevate_priority: bool) -> ThreadGuard {
        let _ = elevate_priority;
        Box::new(())
    }
}

/// One playback endpoint and the native capabilities it can open.
pub trait PlaybackDevice: Send + Sync {
    fn id(&self) -> &DeviceId;

    /// Human-readable name. Returns a placeholder rather than failing.
    fn friendly_name(&self) -> String;

    /// Open a loopback capture stream at the device's native mix format.
    fn open_loopback_capture(
        &self,
        buffer_duration: Duration,
    ) -> Result<Box<dyn CaptureEndpoint>, RelayError>;

    /// Open a shared-mode playback stream using `format` as-is.
    fn open_render(
        &self,
        format: &StreamFormat,
        buffer_duration: Duration,
    ) -> Result<Box<dyn RenderEndpoint>, RelayError>;

    /// Acquire the endpoint volume control.
    ///
    /// Returns [`RelayError::CapabilityUnavailable`] when the device has none.
    fn volume_control(&self) -> Result<Box<dyn VolumeControl>, RelayError>;
}
