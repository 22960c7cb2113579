use crate::models::error::RelayError;
use crate::models::format::{PacketFlags, StreamFormat};

/// A captured packet, borrowed from the capture endpoint until released.
#[derive(Debug)]
pub struct CapturedPacket<'a> {
    /// Interleaved frames in the endpoint's format; `frames * block_align` bytes.
    pub data: &'a [u8],
    pub frames: u32,
    pub flags: PacketFlags,
}

/// A loopback capture stream.
///
/// Owned by the relay thread once the session is running. The capture API is
/// non-blocking: `next_packet` returns `None` when nothing is ready.
pub trait CaptureEndpoint: Send {
    /// The negotiated format, dictated by the source's mix format.
    fn format(&self) -> &StreamFormat;

    fn start(&mut self) -> Result<(), RelayError>;

    fn stop(&mut self) -> Result<(), RelayError>;

    fn next_packet(&mut self) -> Result<Option<CapturedPacket<'_>>, RelayError>;

    /// Hand the last packet's `frames` back to the endpoint.
    fn release_packet(&mut self, frames: u32) -> Result<(), RelayError>;
}

/// A shared-mode playback stream.
pub trait RenderEndpoint: Send {
    fn start(&mut self) -> Result<(), RelayError>;

    fn stop(&mut self) -> Result<(), RelayError>;

    /// Total endpoint buffer size in frames.
    fn buffer_frames(&self) -> u32;

    /// Frames queued but not yet played.
    fn padding_frames(&self) -> Result<u32, RelayError>;

    /// Frames that can be written right now.
    fn free_frames(&self) -> Result<u32, RelayError> {
        Ok(self.buffer_frames().saturating_sub(self.padding_frames()?))
    }

    /// Copy `frames` frames from `data` into the endpoint buffer and commit them.
    ///
    /// Callers check [`free_frames`](Self::free_frames) first.
    fn write_frames(&mut self, data: &[u8], frames: u32, flags: PacketFlags) -> Result<(), RelayError>;
}

/// Native per-endpoint master volume.
///
/// Safe to call while the endpoint is rendering.
pub trait VolumeControl: Send + Sync {
    /// Current master volume in [0, 1].
    fn scalar_volume(&self) -> Result<f32, RelayError>;

    fn set_scalar_volume(&self, volume: f32) -> Result<(), RelayError>;
}
