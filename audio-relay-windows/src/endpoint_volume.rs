use windows::Win32::Media::Audio::Endpoints::IAudioEndpointVolume;
use windows::Win32::Media::Audio::IMMDevice;
use windows::Win32::System::Com::CLSCTX_ALL;

use audio_relay_core::{Capability, DeviceId, RelayError, VolumeControl};

/// Master volume of one render endpoint via `IAudioEndpointVolume`.
pub struct WasapiEndpointVolume {
    id: DeviceId,
    volume: IAudioEndpointVolume,
}

// SAFETY: IAudioEndpointVolume is free-threaded and created in the MTA.
unsafe impl Send for WasapiEndpointVolume {}
unsafe impl Sync for WasapiEndpointVolume {}

impl WasapiEndpointVolume {
    pub(crate) fn open(device: &IMMDevice, id: &DeviceId) -> Result<Self, RelayError> {
        let volume: IAudioEndpointVolume = unsafe { device.Activate(CLSCTX_ALL, None) }.map_err(|e| {
            log::debug!("IAudioEndpointVolume unavailable on {}: {}", id, e);
            RelayError::CapabilityUnavailable {
                device: id.clone(),
                capability: Capability::VolumeControl,
            }
        })?;
        Ok(Self { id: id.clone(), volume })
    }
}

impl VolumeControl for WasapiEndpointVolume {
    fn scalar_volume(&self) -> Result<f32, RelayError> {
        unsafe { self.volume.GetMasterVolumeLevelScalar() }.map_err(|e| {
            RelayError::backend(format!("GetMasterVolumeLevelScalar on {} failed: {}", self.id, e))
        })
    }

    fn set_scalar_volume(&self, volume: f32) -> Result<(), RelayError> {
        unsafe { self.volume.SetMasterVolumeLevelScalar(volume, std::ptr::null()) }.map_err(|e| {
            RelayError::backend(format!("SetMasterVolumeLevelScalar on {} failed: {}", self.id, e))
        })
    }
}
