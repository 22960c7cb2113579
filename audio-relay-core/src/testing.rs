//! In-memory backend for tests.
//!
//! `MockBackend` hands out `MockDevice`s whose capture, render and volume
//! endpoints report to a shared `EndpointTracker`, so tests can assert how
//! many endpoints are open and in which order they were opened and closed.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::models::device::DeviceId;
use crate::models::error::{Capability, RelayError};
use crate::models::format::{PacketFlags, StreamFormat};
use crate::traits::backend::{AudioBackend, PlaybackDevice, ThreadGuard};
use crate::traits::endpoint::{CaptureEndpoint, CapturedPacket, RenderEndpoint, VolumeControl};

/// Counts open endpoints and records lifecycle events in order.
#[derive(Debug, Default)]
pub struct EndpointTracker {
    open: AtomicUsize,
    events: Mutex<Vec<String>>,
}

impl EndpointTracker {
    pub fn open_count(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Events such as `"open capture spk"`, `"stop render hdmi"`, `"close render hdmi"`.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    fn opened(&self, kind: &str, id: &DeviceId) {
        self.open.fetch_add(1, Ordering::SeqCst);
        self.record("open", kind, id);
    }

    fn closed(&self, kind: &str, id: &DeviceId) {
        self.open.fetch_sub(1, Ordering::SeqCst);
        self.record("close", kind, id);
    }

    fn record(&self, action: &str, kind: &str, id: &DeviceId) {
        self.events.lock().push(format!("{} {} {}", action, kind, id));
    }
}

/// What a mock render endpoint received.
#[derive(Debug, Default)]
pub struct RenderStats {
    pub writes: AtomicU64,
    pub frames: AtomicU64,
    pub silent_writes: AtomicU64,
    last: Mutex<Vec<u8>>,
}

impl RenderStats {
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }

    pub fn last_write(&self) -> Vec<u8> {
        self.last.lock().clone()
    }
}

/// A scripted playback device.
pub struct MockDevice {
    id: DeviceId,
    name: Option<String>,
    format: StreamFormat,
    native_volume: Arc<Mutex<f32>>,
    volume_history: Arc<Mutex<Vec<f32>>>,
    has_volume_control: bool,
    packet_frames: u32,
    packet_limit: Option<u64>,
    silent_every: Option<u64>,
    discontinuity_every: Option<u64>,
    render_buffer_frames: u32,
    fail_capture: bool,
    fail_capture_after: Option<u64>,
    fail_render: bool,
    render_stats: Arc<RenderStats>,
    tracker: Arc<EndpointTracker>,
}

impl MockDevice {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: DeviceId::new(id),
            name: Some(name.to_string()),
            format: StreamFormat::float32(48000, 2),
            native_volume: Arc::new(Mutex::new(1.0)),
            volume_history: Arc::new(Mutex::new(Vec::new())),
            has_volume_control: true,
            packet_frames: 480,
            packet_limit: None,
            silent_every: None,
            discontinuity_every: None,
            render_buffer_frames: 4800,
            fail_capture: false,
            fail_capture_after: None,
            fail_render: false,
            render_stats: Arc::new(RenderStats::default()),
            tracker: Arc::new(EndpointTracker::default()),
        }
    }

    pub fn with_volume(self, volume: f32) -> Self {
        *self.native_volume.lock() = volume;
        self
    }

    pub fn without_volume_control(mut self) -> Self {
        self.has_volume_control = false;
        self
    }

    pub fn without_name(mut self) -> Self {
        self.name = None;
        self
    }

    pub fn with_format(mut self, format: StreamFormat) -> Self {
        self.format = format;
        self
    }

    /// Frames per captured packet when used as a source.
    pub fn with_packet_frames(mut self, frames: u32) -> Self {
        self.packet_frames = frames;
        self
    }

    /// Stop producing packets after `limit`; later polls return nothing.
    pub fn with_packet_limit(mut self, limit: u64) -> Self {
        self.packet_limit = Some(limit);
        self
    }

    /// Flag every `n`th packet as silent.
    pub fn with_silent_every(mut self, n: u64) -> Self {
        self.silent_every = Some(n);
        self
    }

    /// Flag every `n`th packet as following a glitch.
    pub fn with_discontinuity_every(mut self, n: u64) -> Self {
        self.discontinuity_every = Some(n);
        self
    }

    /// Free render capacity in frames; padding is always zero.
    pub fn with_render_buffer(mut self, frames: u32) -> Self {
        self.render_buffer_frames = frames;
        self
    }

    pub fn failing_capture(mut self) -> Self {
        self.fail_capture = true;
        self
    }

    /// Open normally, then fail every poll once `packets` packets were delivered.
    pub fn failing_capture_after(mut self, packets: u64) -> Self {
        self.fail_capture_after = Some(packets);
        self
    }

    pub fn failing_render(mut self) -> Self {
        self.fail_render = true;
        self
    }

    pub fn native_volume(&self) -> f32 {
        *self.native_volume.lock()
    }

    /// Every value pushed through the volume control, in order.
    pub fn volume_history(&self) -> Vec<f32> {
        self.volume_history.lock().clone()
    }

    pub fn render_stats(&self) -> Arc<RenderStats> {
        Arc::clone(&self.render_stats)
    }
}

impl PlaybackDevice for MockDevice {
    fn id(&self) -> &DeviceId {
        &self.id
    }

    fn friendly_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| "Unknown Device".into())
    }

    fn open_loopback_capture(
        &self,
        _buffer_duration: Duration,
    ) -> Result<Box<dyn CaptureEndpoint>, RelayError> {
        if self.fail_capture {
            return Err(RelayError::activation(&self.id, "loopback refused"));
        }
        self.tracker.opened("capture", &self.id);
        Ok(Box::new(MockCapture {
            id: self.id.clone(),
            format: self.format,
            packet_frames: self.packet_frames,
            remaining: self.packet_limit,
            silent_every: self.silent_every,
            discontinuity_every: self.discontinuity_every,
            fail_after: self.fail_capture_after,
            sequence: 0,
            buffer: Vec::new(),
            outstanding: None,
            tracker: Arc::clone(&self.tracker),
        }))
    }

    fn open_render(
        &self,
        format: &StreamFormat,
        _buffer_duration: Duration,
    ) -> Result<Box<dyn RenderEndpoint>, RelayError> {
        if self.fail_render {
            return Err(RelayError::activation(&self.id, "render refused"));
        }
        self.tracker.opened("render", &self.id);
        Ok(Box::new(MockRender {
            id: self.id.clone(),
            block_align: format.block_align(),
            buffer_frames: self.render_buffer_frames,
            stats: Arc::clone(&self.render_stats),
            tracker: Arc::clone(&self.tracker),
        }))
    }

    fn volume_control(&self) -> Result<Box<dyn VolumeControl>, RelayError> {
        if !self.has_volume_control {
            return Err(RelayError::CapabilityUnavailable {
                device: self.id.clone(),
                capability: Capability::VolumeControl,
            });
        }
        Ok(Box::new(MockVolume {
            native: Arc::clone(&self.native_volume),
            history: Arc::clone(&self.volume_history),
        }))
    }
}

struct MockCapture {
    id: DeviceId,
    format: StreamFormat,
    packet_frames: u32,
    remaining: Option<u64>,
    silent_every: Option<u64>,
    discontinuity_every: Option<u64>,
    fail_after: Option<u64>,
    sequence: u64,
    buffer: Vec<u8>,
    outstanding: Option<u32>,
    tracker: Arc<EndpointTracker>,
}

impl CaptureEndpoint for MockCapture {
    fn format(&self) -> &StreamFormat {
        &self.format
    }

    fn start(&mut self) -> Result<(), RelayError> {
        self.tracker.record("start", "capture", &self.id);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), RelayError> {
        self.tracker.record("stop", "capture", &self.id);
        Ok(())
    }

    fn next_packet(&mut self) -> Result<Option<CapturedPacket<'_>>, RelayError> {
        if self.outstanding.is_some() {
            return Err(RelayError::backend("previous packet was not released"));
        }
        if self.fail_after.is_some_and(|n| self.sequence >= n) {
            return Err(RelayError::backend("AUDCLNT_E_DEVICE_INVALIDATED"));
        }
        if self.remaining == Some(0) {
            return Ok(None);
        }
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= 1;
        }

        let len = self.format.frames_to_bytes(self.packet_frames);
        let seed = self.sequence as u8;
        self.buffer.clear();
        self.buffer
            .extend((0..len).map(|i| seed.wrapping_add(i as u8)));
        self.sequence += 1;
        self.outstanding = Some(self.packet_frames);

        let every = |n: Option<u64>| n.is_some_and(|n| n > 0 && self.sequence % n == 0);
        let silent = every(self.silent_every);
        let discontinuity = every(self.discontinuity_every);

        Ok(Some(CapturedPacket {
            data: &self.buffer,
            frames: self.packet_frames,
            flags: PacketFlags {
                silent,
                discontinuity,
            },
        }))
    }

    fn release_packet(&mut self, frames: u32) -> Result<(), RelayError> {
        match self.outstanding.take() {
            Some(expected) if expected == frames => Ok(()),
            other => Err(RelayError::backend(format!(
                "release of {} frames, outstanding {:?}",
                frames, other
            ))),
        }
    }
}

impl Drop for MockCapture {
    fn drop(&mut self) {
        self.tracker.closed("capture", &self.id);
    }
}

struct MockRender {
    id: DeviceId,
    block_align: usize,
    buffer_frames: u32,
    stats: Arc<RenderStats>,
    tracker: Arc<EndpointTracker>,
}

impl RenderEndpoint for MockRender {
    fn start(&mut self) -> Result<(), RelayError> {
        self.tracker.record("start", "render", &self.id);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), RelayError> {
        self.tracker.record("stop", "render", &self.id);
        Ok(())
    }

    fn buffer_frames(&self) -> u32 {
        self.buffer_frames
    }

    fn padding_frames(&self) -> Result<u32, RelayError> {
        Ok(0)
    }

    fn write_frames(&mut self, data: &[u8], frames: u32, flags: PacketFlags) -> Result<(), RelayError> {
        if frames > self.buffer_frames {
            return Err(RelayError::backend("AUDCLNT_E_BUFFER_TOO_LARGE"));
        }
        let len = frames as usize * self.block_align;
        if data.len() < len {
            return Err(RelayError::backend("short packet"));
        }
        self.stats.writes.fetch_add(1, Ordering::SeqCst);
        self.stats.frames.fetch_add(frames as u64, Ordering::SeqCst);
        if flags.silent {
            self.stats.silent_writes.fetch_add(1, Ordering::SeqCst);
        }
        *self.stats.last.lock() = data[..len].to_vec();
        Ok(())
    }
}

impl Drop for MockRender {
    fn drop(&mut self) {
        self.tracker.closed("render", &self.id);
    }
}

struct MockVolume {
    native: Arc<Mutex<f32>>,
    history: Arc<Mutex<Vec<f32>>>,
}

impl VolumeControl for MockVolume {
    fn scalar_volume(&self) -> Result<f32, RelayError> {
        Ok(*self.native.lock())
    }

    fn set_scalar_volume(&self, volume: f32) -> Result<(), RelayError> {
        *self.native.lock() = volume;
        self.history.lock().push(volume);
        Ok(())
    }
}

/// Enumerates a mutable list of `MockDevice`s.
#[derive(Default)]
pub struct MockBackend {
    devices: Mutex<Vec<Arc<MockDevice>>>,
    tracker: Arc<EndpointTracker>,
    fail_enumeration: AtomicBool,
    thread_entries: AtomicUsize,
    elevations: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `device` visible to the next enumeration and attach it to this backend's tracker.
    pub fn add(&self, mut device: MockDevice) -> Arc<MockDevice> {
        device.tracker = Arc::clone(&self.tracker);
        let device = Arc::new(device);
        self.devices.lock().push(Arc::clone(&device));
        device
    }

    /// Hide a device from later enumerations.
    pub fn remove(&self, id: &str) {
        self.devices.lock().retain(|d| d.id.as_str() != id);
    }

    pub fn set_enumeration_failure(&self, fail: bool) {
        self.fail_enumeration.store(fail, Ordering::SeqCst);
    }

    pub fn tracker(&self) -> Arc<EndpointTracker> {
        Arc::clone(&self.tracker)
    }

    /// How many relay threads have started.
    pub fn relay_thread_entries(&self) -> usize {
        self.thread_entries.load(Ordering::SeqCst)
    }

    /// How many of those asked for elevated priority.
    pub fn elevation_requests(&self) -> usize {
        self.elevations.load(Ordering::SeqCst)
    }
}

impl AudioBackend for MockBackend {
    fn list_active_render_endpoints(&self) -> Result<Vec<Arc<dyn PlaybackDevice>>, RelayError> {
        if self.fail_enumeration.load(Ordering::SeqCst) {
            return Err(RelayError::backend("EnumAudioEndpoints failed"));
        }
        Ok(self
            .devices
            .lock()
            .iter()
            .map(|d| Arc::clone(d) as Arc<dyn PlaybackDevice>)
            .collect())
    }

    fn enter_relay_thread(&self, elevate_priority: bool) -> ThreadGuard {
        self.thread_entries.fetch_add(1, Ordering::SeqCst);
        if elevate_priority {
            self.elevations.fetch_add(1, Ordering::SeqCst);
        }
        Box::new(())
    }
}
