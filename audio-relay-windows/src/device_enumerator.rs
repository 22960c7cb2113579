//! Playback endpoint enumeration via the MMDevice API.
//!
//! Wraps `IMMDeviceEnumerator` to list active render endpoints and hands
//! each one out as a [`PlaybackDevice`] that can open loopback, render and
//! volume capabilities on itself.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use windows::core::w;
use windows::Win32::Devices::FunctionDiscovery::PKEY_Device_FriendlyName;
use windows::Win32::Foundation::HANDLE;
use windows::Win32::Media::Audio::*;
use windows::Win32::System::Com::*;
use windows::Win32::System::Threading::{AvRevertMmThreadCharacteristics, AvSetMmThreadCharacteristicsW};

use audio_relay_core::{
    AudioBackend, CaptureEndpoint, DeviceId, PlaybackDevice, RelayError, RenderEndpoint, StreamFormat,
    ThreadGuard, VolumeControl,
};

use crate::com::{initialize_mta, ComGuard};
use crate::endpoint_volume::WasapiEndpointVolume;
use crate::wasapi_loopback::WasapiLoopbackCapture;
use crate::wasapi_render::WasapiRender;

const UNKNOWN_DEVICE: &str = "Unknown Device";

/// [`AudioBackend`] over the Windows MMDevice API.
pub struct WasapiBackend {
    enumerator: IMMDeviceEnumerator,
}

// SAFETY: IMMDeviceEnumerator is free-threaded when created in the MTA.
unsafe impl Send for WasapiBackend {}
unsafe impl Sync for WasapiBackend {}

impl WasapiBackend {
    /// Create the device enumerator.
    ///
    /// Requires COM to be initialized (MTA) on the calling thread.
    pub fn new() -> Result<Self, RelayError> {
        let enumerator: IMMDeviceEnumerator = unsafe {
            CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL)
                .map_err(|e| RelayError::backend(format!("failed to create enumerator: {}", e)))?
        };
        Ok(Self { enumerator })
    }
}

impl AudioBackend for WasapiBackend {
    fn list_active_render_endpoints(&self) -> Result<Vec<Arc<dyn PlaybackDevice>>, RelayError> {
        unsafe {
            let collection = self
                .enumerator
                .EnumAudioEndpoints(eRender, DEVICE_STATE_ACTIVE)
                .map_err(|e| RelayError::backend(format!("EnumAudioEndpoints failed: {}", e)))?;

            let count = collection
                .GetCount()
                .map_err(|e| RelayError::backend(format!("GetCount failed: {}", e)))?;

            let mut devices: Vec<Arc<dyn PlaybackDevice>> = Vec::with_capacity(count as usize);
            for i in 0..count {
                let device = match collection.Item(i) {
                    Ok(d) => d,
                    Err(e) => {
                        log::warn!("skipping endpoint {}: {}", i, e);
                        continue;
                    }
                };
                let Some(id) = endpoint_id(&device) else {
                    continue;
                };
                devices.push(Arc::new(WasapiDevice {
                    id,
                    device,
                    name: Mutex::new(None),
                }));
            }
            log::debug!("enumerated {} active render endpoints", devices.len());
            Ok(devices)
        }
    }

    fn enter_relay_thread(&self, elevate_priority: bool) -> ThreadGuard {
        let com = match initialize_mta() {
            Ok(guard) => Some(guard),
            Err(e) => {
                log::warn!("relay thread: {}", e);
                None
            }
        };

        let mmcss = if elevate_priority {
            // MMCSS registration for real-time priority
            let mut task_index: u32 = 0;
            match unsafe { AvSetMmThreadCharacteristicsW(w!("Pro Audio"), &mut task_index) } {
                Ok(handle) => Some(handle),
                Err(e) => {
                    log::warn!("MMCSS registration refused, running at normal priority: {}", e);
                    None
                }
            }
        } else {
            None
        };

        Box::new(RelayThreadGuard { mmcss, _com: com })
    }
}

/// Undoes the relay thread's MMCSS registration, then its COM initialization.
struct RelayThreadGuard {
    mmcss: Option<HANDLE>,
    _com: Option<ComGuard>,
}

impl Drop for RelayThreadGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.mmcss.take() {
            if let Err(e) = unsafe { AvRevertMmThreadCharacteristics(handle) } {
                log::debug!("AvRevertMmThreadCharacteristics failed: {}", e);
            }
        }
    }
}

/// One active render endpoint.
pub struct WasapiDevice {
    id: DeviceId,
    device: IMMDevice,
    /// Resolved on first request.
    name: Mutex<Option<String>>,
}

// SAFETY: IMMDevice is free-threaded when created in the MTA.
unsafe impl Send for WasapiDevice {}
unsafe impl Sync for WasapiDevice {}

impl PlaybackDevice for WasapiDevice {
    fn id(&self) -> &DeviceId {
        &self.id
    }

    fn friendly_name(&self) -> String {
        let mut cached = self.name.lock();
        if let Some(name) = cached.as_ref() {
            return name.clone();
        }
        match read_friendly_name(&self.device) {
            Some(name) => {
                *cached = Some(name.clone());
                name
            }
            None => UNKNOWN_DEVICE.to_string(),
        }
    }

    fn open_loopback_capture(
        &self,
        buffer_duration: Duration,
    ) -> Result<Box<dyn CaptureEndpoint>, RelayError> {
        let capture = WasapiLoopbackCapture::open(&self.device, &self.id, buffer_duration)?;
        Ok(Box::new(capture))
    }

    fn open_render(
        &self,
        format: &StreamFormat,
        buffer_duration: Duration,
    ) -> Result<Box<dyn RenderEndpoint>, RelayError> {
        let render = WasapiRender::open(&self.device, &self.id, format, buffer_duration)?;
        Ok(Box::new(render))
    }

    fn volume_control(&self) -> Result<Box<dyn VolumeControl>, RelayError> {
        let volume = WasapiEndpointVolume::open(&self.device, &self.id)?;
        Ok(Box::new(volume))
    }
}

/// The endpoint ID string; stable for the same physical device.
fn endpoint_id(device: &IMMDevice) -> Option<DeviceId> {
    unsafe {
        let raw = match device.GetId() {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("GetId failed: {}", e);
                return None;
            }
        };
        let id = raw.to_string();
        CoTaskMemFree(Some(raw.0 as *const _));
        id.ok().map(DeviceId::from)
    }
}

/// Read `PKEY_Device_FriendlyName` from the device's property store.
fn read_friendly_name(device: &IMMDevice) -> Option<String> {
    unsafe {
        let store = device.OpenPropertyStore(STGM_READ).ok()?;
        let value = store.GetValue(&PKEY_Device_FriendlyName).ok()?;
        let name = value.to_string();
        (!name.is_empty()).then_some(name)
    }
}
