//! WASAPI loopback capture on a render endpoint.
//!
//! Captures the mix a playback device is rendering using
//! `AUDCLNT_STREAMFLAGS_LOOPBACK`. Shared mode only; the format is the
//! device's mix format. DRM-protected audio arrives as silence.

use std::time::Duration;

use windows::Win32::Media::Audio::*;
use windows::Win32::System::Com::CLSCTX_ALL;

use audio_relay_core::{CaptureEndpoint, CapturedPacket, DeviceId, PacketFlags, RelayError, StreamFormat};

use crate::mix_format::MixFormat;

/// Loopback capture stream, polled by the relay thread.
pub struct WasapiLoopbackCapture {
    id: DeviceId,
    client: IAudioClient,
    capture: IAudioCaptureClient,
    format: StreamFormat,
    started: bool,
}

// SAFETY: the clients are created in the multithreaded apartment and
// WASAPI interfaces are free-threaded. The stream is used by one thread at a time.
unsafe impl Send for WasapiLoopbackCapture {}

impl WasapiLoopbackCapture {
    /// Activate a loopback client on `device` at its mix format.
    ///
    /// Sequence:
    /// 1. Activate IAudioClient
    /// 2. GetMixFormat
    /// 3. Initialize with LOOPBACK in shared mode
    /// 4. Get IAudioCaptureClient
    pub(crate) fn open(
        device: &IMMDevice,
        id: &DeviceId,
        buffer_duration: Duration,
    ) -> Result<Self, RelayError> {
        unsafe {
            let client: IAudioClient = device
                .Activate(CLSCTX_ALL, None)
                .map_err(|e| RelayError::activation(id, format!("Activate failed: {}", e)))?;

            let mix_format = MixFormat::query(&client, id)?;
            let format = mix_format.to_stream_format(id)?;

            client
                .Initialize(
                    AUDCLNT_SHAREMODE_SHARED,
                    AUDCLNT_STREAMFLAGS_LOOPBACK,
                    to_reference_time(buffer_duration),
                    0,
                    mix_format.as_ptr(),
                    None,
                )
                .map_err(|e| {
                    RelayError::activation(id, format!("IAudioClient::Initialize (loopback) failed: {}", e))
                })?;

            let capture: IAudioCaptureClient = client
                .GetService()
                .map_err(|e| RelayError::activation(id, format!("GetService failed: {}", e)))?;

            log::debug!("loopback on {} opened: {}", id, format);
            Ok(Self {
                id: id.clone(),
                client,
                capture,
                format,
                started: false,
            })
        }
    }

    fn fail(&self, call: &str, e: windows::core::Error) -> RelayError {
        RelayError::backend(format!("{} on {} failed: {}", call, self.id, e))
    }
}

impl CaptureEndpoint for WasapiLoopbackCapture {
    fn format(&self) -> &StreamFormat {
        &self.format
    }

    fn start(&mut self) -> Result<(), RelayError> {
        unsafe { self.client.Start() }.map_err(|e| self.fail("IAudioClient::Start", e))?;
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), RelayError> {
        if !self.started {
            return Ok(());
        }
        self.started = false;
        unsafe { self.client.Stop() }.map_err(|e| self.fail("IAudioClient::Stop", e))
    }

    fn next_packet(&mut self) -> Result<Option<CapturedPacket<'_>>, RelayError> {
        let pending = unsafe { self.capture.GetNextPacketSize() }
            .map_err(|e| self.fail("GetNextPacketSize", e))?;
        if pending == 0 {
            return Ok(None);
        }

        let mut data: *mut u8 = std::ptr::null_mut();
        let mut frames: u32 = 0;
        let mut flags: u32 = 0;
        unsafe {
            self.capture
                .GetBuffer(&mut data, &mut frames, &mut flags, None, None)
                .map_err(|e| self.fail("GetBuffer", e))?;
        }

        if frames == 0 {
            unsafe { self.capture.ReleaseBuffer(0) }.map_err(|e| self.fail("ReleaseBuffer", e))?;
            return Ok(None);
        }

        let len = self.format.frames_to_bytes(frames);
        let bytes: &[u8] = if data.is_null() {
            &[]
        } else {
            // SAFETY: GetBuffer hands out `frames` whole frames, valid until ReleaseBuffer.
            unsafe { std::slice::from_raw_parts(data, len) }
        };

        Ok(Some(CapturedPacket {
            data: bytes,
            frames,
            flags: PacketFlags {
                silent: flags & (AUDCLNT_BUFFERFLAGS_SILENT.0 as u32) != 0,
                discontinuity: flags & (AUDCLNT_BUFFERFLAGS_DATA_DISCONTINUITY.0 as u32) != 0,
            },
        }))
    }

    fn release_packet(&mut self, frames: u32) -> Result<(), RelayError> {
        unsafe { self.capture.ReleaseBuffer(frames) }.map_err(|e| self.fail("ReleaseBuffer", e))
    }
}

impl Drop for WasapiLoopbackCapture {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("{}", e);
        }
    }
}

/// Convert to `REFERENCE_TIME` (100 ns units).
pub(crate) fn to_reference_time(duration: Duration) -> i64 {
    (duration.as_nanos() / 100).min(i64::MAX as u128) as i64
}
