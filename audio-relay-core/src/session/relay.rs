use std::sync::Arc;

use crate::devices::arena::{DeviceArena, DeviceLease};
use crate::devices::directory::{DeviceDirectory, RefreshSummary, RoleChange};
use crate::engine::RelayEngine;
use crate::models::config::RelayConfiguration;
use crate::models::device::{DeviceId, DeviceInfo, DeviceRole};
use crate::models::diagnostics::{RelayDiagnostics, RelayStatus};
use crate::models::error::{Precondition, RelayError};
use crate::models::format::StreamFormat;
use crate::models::state::RelayState;
use crate::traits::backend::AudioBackend;
use crate::traits::delegate::RelayDelegate;
use crate::volume::controller::VolumeController;

/// One relay: device roles, volumes and the relay engine behind a single context.
///
/// Construct as many as needed; nothing is process-global.
///
/// ```text
/// [Source] ─loopback─→ [relay thread] ─┬→ [Target 1]
///                                      ├→ [Target 2]
///                                      └→ ...
/// ```
pub struct AudioRelay<B: AudioBackend + 'static> {
    // Field order is drop order: engine before volumes before directory.
    engine: RelayEngine,
    volumes: VolumeController,
    directory: DeviceDirectory,
    backend: Arc<B>,
}

impl<B: AudioBackend + 'static> AudioRelay<B> {
    /// Validate `config` and run the first device enumeration.
    pub fn new(backend: B, config: RelayConfiguration) -> Result<Self, RelayError> {
        config.validate().map_err(RelayError::ConfigurationFailed)?;

        let mut relay = Self {
            volumes: VolumeController::new(config.initial_global_volume),
            engine: RelayEngine::new(config),
            directory: DeviceDirectory::new(DeviceArena::new()),
            backend: Arc::new(backend),
        };
        relay.refresh()?;
        Ok(relay)
    }

    pub fn set_delegate(&mut self, delegate: Arc<dyn RelayDelegate>) {
        self.engine.set_delegate(delegate);
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &RelayConfiguration {
        self.engine.config()
    }

    pub fn state(&self) -> RelayState {
        self.engine.state()
    }

    pub fn global_volume(&self) -> f32 {
        self.volumes.global_volume()
    }

    /// Re-enumerate playback devices. The Source and Targets are never evicted.
    pub fn refresh(&mut self) -> Result<RefreshSummary, RelayError> {
        let discovered = self.backend.list_active_render_endpoints()?;
        Ok(self.directory.refresh(discovered))
    }

    /// Role currently held by `id`, or `None` if untracked.
    pub fn role_of(&self, id: &DeviceId) -> Option<DeviceRole> {
        self.directory.role_of(id)
    }

    /// Every tracked device: Source, then Targets, then Available.
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.directory
            .entries()
            .into_iter()
            .filter_map(|(id, role)| {
                let lease = self.directory.lease(&id)?;
                Some(self.describe(lease, role))
            })
            .collect()
    }

    pub fn status(&self) -> RelayStatus {
        let source = self
            .directory
            .source()
            .map(|lease| self.describe(lease, DeviceRole::Source));
        let targets = self
            .directory
            .targets()
            .iter()
            .map(|lease| self.describe(lease, DeviceRole::Target))
            .collect();
        let available = self
            .directory
            .available()
            .iter()
            .map(|lease| self.describe(lease, DeviceRole::Available))
            .collect();

        RelayStatus {
            state: self.engine.state(),
            global_volume: self.volumes.global_volume(),
            source,
            targets,
            available,
            diagnostics: self.engine.diagnostics(),
        }
    }

    pub fn diagnostics(&self) -> Option<RelayDiagnostics> {
        self.engine.diagnostics()
    }

    /// Make `id` the Source, returning any previous Source to Available.
    ///
    /// Fails with `SourceInUse` while a session captures from a different Source.
    pub fn assign_source(&mut self, id: &DeviceId) -> Result<(), RelayError> {
        self.engine.reap_faulted();
        if let Some(current) = self.directory.source() {
            if current.id() != id && self.engine.is_capturing_from(current.id()) {
                return Err(RelayError::PreconditionNotMet(Precondition::SourceInUse));
            }
        }

        if let RoleChange::Moved {
            from: DeviceRole::Target,
            ..
        } = self.directory.assign_source(id)?
        {
            self.volumes.detach(id);
        }
        Ok(())
    }

    /// Add `id` to the Targets and bind its volume control.
    ///
    /// A running session keeps the Targets it started with; the new Target
    /// joins on the next `start`.
    pub fn assign_target(&mut self, id: &DeviceId) -> Result<(), RelayError> {
        self.engine.reap_faulted();
        if self.engine.is_capturing_from(id) {
            return Err(RelayError::PreconditionNotMet(Precondition::SourceInUse));
        }

        if let RoleChange::Moved { lease, .. } = self.directory.assign_target(id)? {
            self.volumes.attach(lease);
        }
        Ok(())
    }

    /// Return `id` to Available, discarding its volume entry if it was a Target.
    pub fn release(&mut self, id: &DeviceId) -> Result<DeviceRole, RelayError> {
        self.engine.reap_faulted();
        if self.engine.is_capturing_from(id) {
            return Err(RelayError::PreconditionNotMet(Precondition::SourceInUse));
        }

        let from = self.directory.release(id)?;
        if from == DeviceRole::Target {
            self.volumes.detach(id);
        }
        Ok(from)
    }

    /// Return every Target to Available. Fails with `NothingToClear` when there are none.
    pub fn clear_all_targets(&mut self) -> Result<Vec<DeviceId>, RelayError> {
        let cleared = self.directory.clear_targets()?;
        self.volumes.detach_all();
        Ok(cleared)
    }

    /// Returns the stored (clamped) global volume.
    pub fn set_global_volume(&mut self, volume: f32) -> f32 {
        self.volumes.set_global_volume(volume)
    }

    /// Returns the effective volume now applied to the device.
    pub fn set_device_volume(&mut self, id: &DeviceId, volume: f32) -> Result<f32, RelayError> {
        self.volumes.set_device_volume(id, volume)
    }

    /// Start relaying from the Source to every current Target.
    pub fn start(&mut self) -> Result<StreamFormat, RelayError> {
        let backend = Arc::clone(&self.backend) as Arc<dyn AudioBackend>;
        self.engine.start(backend, self.directory.roster())
    }

    /// Stop relaying. Returns `false` if nothing was running.
    pub fn stop(&mut self) -> bool {
        self.engine.stop()
    }

    /// Stop the engine, then release volume controls, Targets, Source and
    /// Available devices in that order. Safe to call more than once.
    pub fn shutdown(&mut self) {
        self.engine.stop();
        self.volumes.detach_all();
        self.directory.clear();
        log::debug!("relay shut down; {} devices still leased", self.directory.arena().len());
    }

    fn describe(&self, lease: &DeviceLease, role: DeviceRole) -> DeviceInfo {
        let id = lease.id();
        DeviceInfo {
            id: id.clone(),
            name: lease.device().friendly_name(),
            role,
            individual_volume: self.volumes.individual_volume(id),
            effective_volume: self.volumes.effective_volume(id),
            has_volume_control: self.volumes.has_control(id),
        }
    }
}

impl<B: AudioBackend + 'static> Drop for AudioRelay<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::{Duration, Instant};

    use approx::assert_relative_eq;

    use super::*;
    use crate::testing::{MockBackend, MockDevice};

    fn id(s: &str) -> DeviceId {
        DeviceId::new(s)
    }

    fn config() -> RelayConfiguration {
        RelayConfiguration {
            poll_interval: Duration::from_micros(50),
            ..Default::default()
        }
    }

    fn backend_with(devices: Vec<MockDevice>) -> MockBackend {
        let backend = MockBackend::new();
        for device in devices {
            backend.add(device);
        }
        backend
    }

    fn relay(devices: Vec<MockDevice>) -> AudioRelay<MockBackend> {
        AudioRelay::new(backend_with(devices), config()).unwrap()
    }

    fn three_devices() -> Vec<MockDevice> {
        vec![
            MockDevice::new("a", "Speakers"),
            MockDevice::new("b", "Headphones"),
            MockDevice::new("c", "HDMI"),
        ]
    }

    /// Every tracked device appears exactly once across the three roles.
    fn assert_partition(relay: &AudioRelay<MockBackend>) {
        let status = relay.status();
        let mut seen = HashSet::new();
        let all = status
            .source
            .iter()
            .chain(&status.targets)
            .chain(&status.available);
        for info in all {
            assert!(seen.insert(info.id.clone()), "{} tracked twice", info.id);
            assert_eq!(relay.role_of(&info.id), Some(info.role));
        }
        assert_eq!(seen.len(), relay.devices().len());
    }

    #[test]
    fn new_rejects_invalid_config() {
        let result = AudioRelay::new(
            MockBackend::new(),
            RelayConfiguration {
                initial_global_volume: 1.5,
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(RelayError::ConfigurationFailed(_))));
    }

    #[test]
    fn new_propagates_enumeration_failure() {
        let backend = MockBackend::new();
        backend.set_enumeration_failure(true);
        assert!(matches!(
            AudioRelay::new(backend, config()),
            Err(RelayError::Backend(_))
        ));
    }

    #[test]
    fn initial_refresh_populates_available() {
        let relay = relay(three_devices());
        let devices = relay.devices();
        assert_eq!(devices.len(), 3);
        assert!(devices.iter().all(|d| d.role == DeviceRole::Available));
        assert_eq!(devices[0].name, "Speakers");
    }

    #[test]
    fn unnamed_device_gets_placeholder() {
        let relay = relay(vec![MockDevice::new("x", "X").without_name()]);
        assert_eq!(relay.devices()[0].name, "Unknown Device");
    }

    #[test]
    fn partition_holds_across_mutations() {
        let mut relay = relay(three_devices());
        assert_partition(&relay);

        relay.assign_source(&id("a")).unwrap();
        assert_partition(&relay);
        relay.assign_target(&id("b")).unwrap();
        assert_partition(&relay);
        relay.assign_target(&id("a")).unwrap();
        assert_partition(&relay);
        assert!(relay.status().source.is_none());
        relay.assign_source(&id("b")).unwrap();
        assert_partition(&relay);
        relay.assign_source(&id("c")).unwrap();
        assert_partition(&relay);
        relay.release(&id("a")).unwrap();
        assert_partition(&relay);
        relay.assign_target(&id("a")).unwrap();
        relay.clear_all_targets().unwrap();
        assert_partition(&relay);
        relay.refresh().unwrap();
        assert_partition(&relay);
    }

    #[test]
    fn target_volume_preserves_native_level() {
        let mut relay = relay(vec![MockDevice::new("spk", "Speakers").with_volume(0.42)]);
        relay.set_global_volume(0.7);
        relay.assign_target(&id("spk")).unwrap();

        let info = &relay.status().targets[0];
        let individual = info.individual_volume.unwrap();
        assert_relative_eq!(0.7 * individual, 0.42, epsilon = 1e-6);
        assert_relative_eq!(info.effective_volume.unwrap(), 0.42, epsilon = 1e-6);
    }

    #[test]
    fn global_volume_sequence_recomputes_effective() {
        let backend = MockBackend::new();
        let device = backend.add(MockDevice::new("spk", "Speakers"));
        let mut relay = AudioRelay::new(backend, config()).unwrap();

        relay.assign_target(&id("spk")).unwrap();
        relay.set_device_volume(&id("spk"), 0.8).unwrap();
        relay.set_global_volume(0.5);
        relay.set_global_volume(1.0);

        let history = device.volume_history();
        let tail = &history[history.len() - 2..];
        assert_relative_eq!(tail[0], 0.4, epsilon = 1e-6);
        assert_relative_eq!(tail[1], 0.8, epsilon = 1e-6);
    }

    #[test]
    fn device_volume_requires_target_role() {
        let mut relay = relay(three_devices());
        relay.assign_source(&id("a")).unwrap();

        assert_eq!(
            relay.set_device_volume(&id("a"), 0.5).unwrap_err(),
            RelayError::NotFound(id("a"))
        );
        assert_eq!(
            relay.set_device_volume(&id("b"), 0.5).unwrap_err(),
            RelayError::NotFound(id("b"))
        );
    }

    #[test]
    fn target_moved_to_source_loses_volume_entry() {
        let mut relay = relay(three_devices());
        relay.assign_target(&id("a")).unwrap();
        relay.set_device_volume(&id("a"), 0.3).unwrap();

        relay.assign_source(&id("a")).unwrap();
        assert_eq!(relay.role_of(&id("a")), Some(DeviceRole::Source));
        assert!(relay.status().source.unwrap().individual_volume.is_none());

        relay.release(&id("a")).unwrap();
        relay.assign_target(&id("a")).unwrap();
        assert_relative_eq!(
            relay.status().targets[0].individual_volume.unwrap(),
            0.3,
            epsilon = 1e-6
        );
    }

    #[test]
    fn unknown_device_is_not_found() {
        let mut relay = relay(three_devices());
        let ghost = id("ghost");
        assert_eq!(relay.assign_source(&ghost).unwrap_err(), RelayError::NotFound(ghost.clone()));
        assert_eq!(relay.assign_target(&ghost).unwrap_err(), RelayError::NotFound(ghost.clone()));
        assert_eq!(relay.release(&ghost).unwrap_err(), RelayError::NotFound(ghost));
    }

    #[test]
    fn release_of_available_device_is_precondition() {
        let mut relay = relay(three_devices());
        assert_eq!(
            relay.release(&id("a")).unwrap_err(),
            RelayError::PreconditionNotMet(Precondition::NotAssigned)
        );
    }

    #[test]
    fn clear_with_no_targets_leaves_available_alone() {
        let mut relay = relay(three_devices());
        let before = relay.status().available;

        assert_eq!(
            relay.clear_all_targets().unwrap_err(),
            RelayError::PreconditionNotMet(Precondition::NothingToClear)
        );
        assert_eq!(relay.status().available, before);
    }

    #[test]
    fn refresh_keeps_assigned_devices() {
        let backend = backend_with(vec![
            MockDevice::new("src", "Source"),
            MockDevice::new("tgt", "Target"),
            MockDevice::new("idle", "Idle"),
        ]);
        let mut relay = AudioRelay::new(backend, config()).unwrap();
        relay.assign_source(&id("src")).unwrap();
        relay.assign_target(&id("tgt")).unwrap();

        relay.backend().remove("src");
        relay.backend().remove("tgt");
        relay.backend().remove("idle");
        relay.backend().add(MockDevice::new("new", "New"));
        let summary = relay.refresh().unwrap();

        assert_eq!(summary.added, vec![id("new")]);
        assert_eq!(summary.dropped, vec![id("idle")]);
        assert_eq!(relay.role_of(&id("src")), Some(DeviceRole::Source));
        assert_eq!(relay.role_of(&id("tgt")), Some(DeviceRole::Target));
        assert_eq!(relay.role_of(&id("new")), Some(DeviceRole::Available));
        assert_eq!(relay.role_of(&id("idle")), None);
    }

    #[test]
    fn start_without_source_stays_idle() {
        let mut relay = relay(three_devices());
        relay.assign_target(&id("b")).unwrap();

        assert_eq!(
            relay.start().unwrap_err(),
            RelayError::PreconditionNotMet(Precondition::NoSource)
        );
        assert_eq!(relay.state(), RelayState::Idle);
    }

    #[test]
    fn start_stop_twice_leaves_no_open_endpoints() {
        let mut relay = relay(three_devices());
        relay.assign_source(&id("a")).unwrap();
        relay.assign_target(&id("b")).unwrap();
        relay.assign_target(&id("c")).unwrap();

        relay.start().unwrap();
        assert!(relay.state().is_running());
        assert_eq!(relay.backend().tracker().open_count(), 3);

        assert!(relay.stop());
        assert!(!relay.stop());
        assert_eq!(relay.backend().tracker().open_count(), 0);
        assert!(relay.state().is_idle());
    }

    #[test]
    fn source_in_use_while_running() {
        let mut relay = relay(three_devices());
        relay.assign_source(&id("a")).unwrap();
        relay.assign_target(&id("b")).unwrap();
        relay.start().unwrap();

        let in_use = RelayError::PreconditionNotMet(Precondition::SourceInUse);
        assert_eq!(relay.assign_source(&id("c")).unwrap_err(), in_use);
        assert_eq!(relay.release(&id("a")).unwrap_err(), in_use);
        assert_eq!(relay.assign_target(&id("a")).unwrap_err(), in_use);
        relay.assign_source(&id("a")).unwrap();
        assert_partition(&relay);

        relay.stop();
        relay.assign_source(&id("c")).unwrap();
        assert_eq!(relay.role_of(&id("a")), Some(DeviceRole::Available));
    }

    #[test]
    fn source_is_free_again_after_capture_fault() {
        let mut relay = relay(vec![
            MockDevice::new("a", "Speakers").failing_capture_after(0),
            MockDevice::new("b", "Headphones"),
            MockDevice::new("c", "HDMI"),
        ]);
        relay.assign_source(&id("a")).unwrap();
        relay.assign_target(&id("b")).unwrap();
        relay.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while relay.state().is_running() {
            assert!(Instant::now() < deadline, "relay never faulted");
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(relay.status().diagnostics.is_some_and(|d| d.faulted));

        relay.assign_source(&id("c")).unwrap();
        assert_eq!(relay.role_of(&id("a")), Some(DeviceRole::Available));
        assert!(relay.diagnostics().is_none());
        assert_eq!(relay.backend().tracker().open_count(), 0);
        assert_partition(&relay);

        relay.start().unwrap();
        assert!(relay.state().is_running());
        assert!(relay.stop());
        assert_eq!(relay.backend().tracker().open_count(), 0);
    }

    #[test]
    fn target_changes_while_running_apply_on_next_start() {
        let mut relay = relay(three_devices());
        relay.assign_source(&id("a")).unwrap();
        relay.assign_target(&id("b")).unwrap();
        relay.start().unwrap();

        relay.assign_target(&id("c")).unwrap();
        relay.release(&id("b")).unwrap();
        assert_eq!(relay.backend().tracker().open_count(), 2);
        assert_eq!(relay.diagnostics().unwrap().targets[0].id, id("b"));

        relay.stop();
        relay.start().unwrap();
        let diagnostics = relay.diagnostics().unwrap();
        assert_eq!(diagnostics.targets.len(), 1);
        assert_eq!(diagnostics.targets[0].id, id("c"));
        relay.stop();
    }

    #[test]
    fn volume_changes_while_running() {
        let backend = MockBackend::new();
        backend.add(MockDevice::new("src", "Source"));
        let target = backend.add(MockDevice::new("tgt", "Target"));
        let mut relay = AudioRelay::new(backend, config()).unwrap();
        relay.assign_source(&id("src")).unwrap();
        relay.assign_target(&id("tgt")).unwrap();
        relay.start().unwrap();

        relay.set_global_volume(0.25);
        relay.set_device_volume(&id("tgt"), 0.5).unwrap();
        assert_relative_eq!(target.native_volume(), 0.125, epsilon = 1e-6);

        let deadline = Instant::now() + Duration::from_secs(10);
        while relay.diagnostics().unwrap().targets[0].packets_delivered < 10 {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
        relay.stop();
    }

    #[test]
    fn status_serializes_to_json() {
        let mut relay = relay(three_devices());
        relay.assign_source(&id("a")).unwrap();
        relay.assign_target(&id("b")).unwrap();

        let json = serde_json::to_value(relay.status()).unwrap();
        assert_eq!(json["state"], "idle");
        assert_eq!(json["source"]["id"], "a");
        assert_eq!(json["targets"][0]["role"], "target");
        assert_eq!(json["available"].as_array().unwrap().len(), 1);
        assert!(json["diagnostics"].is_null());
    }

    #[test]
    fn shutdown_releases_everything() {
        let mut relay = relay(three_devices());
        relay.assign_source(&id("a")).unwrap();
        relay.assign_target(&id("b")).unwrap();
        relay.start().unwrap();

        relay.shutdown();
        relay.shutdown();

        assert!(relay.state().is_idle());
        assert!(relay.devices().is_empty());
        assert_eq!(relay.backend().tracker().open_count(), 0);
    }

    #[test]
    fn independent_relays_run_side_by_side() {
        let mut first = relay(three_devices());
        let mut second = relay(three_devices());
        for relay in [&mut first, &mut second] {
            relay.assign_source(&id("a")).unwrap();
            relay.assign_target(&id("b")).unwrap();
            relay.start().unwrap();
        }

        assert!(first.stop());
        assert!(second.state().is_running());
        assert!(second.stop());
    }
}
