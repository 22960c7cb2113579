//! WASAPI shared-mode render stream fed by the relay loop.

use std::time::Duration;

use windows::Win32::Media::Audio::*;
use windows::Win32::System::Com::CLSCTX_ALL;

use audio_relay_core::{DeviceId, PacketFlags, RelayError, RenderEndpoint, StreamFormat};

use crate::mix_format::wave_format_for;
use crate::wasapi_loopback::to_reference_time;

pub struct WasapiRender {
    id: DeviceId,
    client: IAudioClient,
    render: IAudioRenderClient,
    buffer_frames: u32,
    block_align: usize,
    started: bool,
}

// SAFETY: see `WasapiLoopbackCapture`.
unsafe impl Send for WasapiRender {}

impl WasapiRender {
    /// Activate a render client on `device` using `format` unchanged.
    ///
    /// Fails if the device's engine rejects the format; no conversion is requested.
    pub(crate) fn open(
        device: &IMMDevice,
        id: &DeviceId,
        format: &StreamFormat,
        buffer_duration: Duration,
    ) -> Result<Self, RelayError> {
        let wave_format = wave_format_for(format);
        unsafe {
            let client: IAudioClient = device
                .Activate(CLSCTX_ALL, None)
                .map_err(|e| RelayError::activation(id, format!("Activate failed: {}", e)))?;

            client
                .Initialize(
                    AUDCLNT_SHAREMODE_SHARED,
                    0,
                    to_reference_time(buffer_duration),
                    0,
                    &wave_format as *const WAVEFORMATEXTENSIBLE as *const WAVEFORMATEX,
                    None,
                )
                .map_err(|e| {
                    RelayError::activation(id, format!("IAudioClient::Initialize ({}) failed: {}", format, e))
                })?;

            let buffer_frames = client
                .GetBufferSize()
                .map_err(|e| RelayError::activation(id, format!("GetBufferSize failed: {}", e)))?;

            let render: IAudioRenderClient = client
                .GetService()
                .map_err(|e| RelayError::activation(id, format!("GetService failed: {}", e)))?;

            log::debug!("render on {} opened: {} frames", id, buffer_frames);
            Ok(Self {
                id: id.clone(),
                client,
                render,
                buffer_frames,
                block_align: format.block_align(),
                started: false,
            })
        }
    }

    fn fail(&self, call: &str, e: windows::core::Error) -> RelayError {
        RelayError::backend(format!("{} on {} failed: {}", call, self.id, e))
    }
}

impl RenderEndpoint for WasapiRender {
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

    fn buffer_frames(&self) -> u32 {
        self.buffer_frames
    }

    fn padding_frames(&self) -> Result<u32, RelayError> {
        unsafe { self.client.GetCurrentPadding() }.map_err(|e| self.fail("GetCurrentPadding", e))
    }

    fn write_frames(&mut self, data: &[u8], frames: u32, flags: PacketFlags) -> Result<(), RelayError> {
        let len = frames as usize * self.block_align;
        // A packet without usable bytes is committed as silence.
        let complete = data.len() >= len;
        let silent = flags.silent || !complete;

        unsafe {
            let buffer = self
                .render
                .GetBuffer(frames)
                .map_err(|e| self.fail("IAudioRenderClient::GetBuffer", e))?;
            if complete {
                std::ptr::copy_nonoverlapping(data.as_ptr(), buffer, len);
            }
            let release_flags = if silent {
                AUDCLNT_BUFFERFLAGS_SILENT.0 as u32
            } else {
                0
            };
            self.render
                .ReleaseBuffer(frames, release_flags)
                .map_err(|e| self.fail("IAudioRenderClient::ReleaseBuffer", e))
        }
    }
}

impl Drop for WasapiRender {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("{}", e);
        }
    }
}
