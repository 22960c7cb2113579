//! # audio-relay-windows
//!
//! Windows WASAPI backend for audio-relay.
//!
//! Provides:
//! - `WasapiBackend`: render endpoint enumeration via the MMDevice API, MMCSS on the relay thread
//! - `WasapiDevice`: one endpoint; opens loopback, render and volume capabilities
//! - `WasapiLoopbackCapture`: shared-mode loopback capture at the mix format
//! - `WasapiRender`: shared-mode render at the negotiated format
//! - `WasapiEndpointVolume`: master volume via `IAudioEndpointVolume`
//!
//! ## Usage
//! ```ignore
//! use audio_relay_core::{AudioRelay, RelayConfiguration};
//! use audio_relay_windows::{com, WasapiBackend};
//!
//! let _com = com::initialize_mta()?;
//! let mut relay = AudioRelay::new(WasapiBackend::new()?, RelayConfiguration::default())?;
//! ```

#[cfg(target_os = "windows")]
pub mod com;
#[cfg(target_os = "windows")]
pub mod device_enumerator;
#[cfg(target_os = "windows")]
pub mod endpoint_volume;
#[cfg(target_os = "windows")]
mod mix_format;
#[cfg(target_os = "windows")]
pub mod wasapi_loopback;
#[cfg(target_os = "windows")]
pub mod wasapi_render;

#[cfg(target_os = "windows")]
pub use device_enumerator::{WasapiBackend, WasapiDevice};
#[cfg(target_os = "windows")]
pub use endpoint_volume::WasapiEndpointVolume;
#[cfg(target_os = "windows")]
pub use wasapi_loopback::WasapiLoopbackCapture;
#[cfg(target_os = "windows")]
pub use wasapi_render::WasapiRender;
