use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::devices::arena::DeviceLease;
use crate::devices::directory::Roster;
use crate::engine::relay_loop::{run_loop, SessionCounters};
use crate::models::config::RelayConfiguration;
use crate::models::device::DeviceId;
use crate::models::diagnostics::RelayDiagnostics;
use crate::models::error::{Precondition, RelayError};
use crate::models::format::StreamFormat;
use crate::models::state::RelayState;
use crate::traits::backend::AudioBackend;
use crate::traits::delegate::RelayDelegate;
use crate::traits::endpoint::{CaptureEndpoint, RenderEndpoint};

/// Endpoints opened for one session, in acquisition order.
struct SessionEndpoints {
    capture: Box<dyn CaptureEndpoint>,
    renders: Vec<Box<dyn RenderEndpoint>>,
}

impl SessionEndpoints {
    /// Stop and release every endpoint in reverse acquisition order.
    ///
    /// Consumes `self`, so it runs at most once per session.
    fn teardown(mut self) {
        while let Some(mut render) = self.renders.pop() {
            if let Err(e) = render.stop() {
                log::warn!("failed to stop render endpoint: {}", e);
            }
            drop(render);
        }
        if let Err(e) = self.capture.stop() {
            log::warn!("failed to stop capture endpoint: {}", e);
        }
    }
}

struct ActiveSession {
    id: Uuid,
    started_at: DateTime<Utc>,
    format: StreamFormat,
    roster: Roster,
    counters: Arc<SessionCounters>,
    handle: thread::JoinHandle<Option<SessionEndpoints>>,
}

impl ActiveSession {
    fn faulted(&self) -> bool {
        self.counters.faulted.load(Ordering::Acquire)
    }
}

/// Owns the relay thread and the endpoints of the running session.
///
/// The render endpoints are fixed when the session starts. Targets assigned
/// or released while running are picked up by the next `start`.
pub struct RelayEngine {
    config: RelayConfiguration,
    running: Arc<AtomicBool>,
    session: Option<ActiveSession>,
    delegate: Option<Arc<dyn RelayDelegate>>,
}

impl RelayEngine {
    pub fn new(config: RelayConfiguration) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            session: None,
            delegate: None,
        }
    }

    pub fn set_delegate(&mut self, delegate: Arc<dyn RelayDelegate>) {
        self.delegate = Some(delegate);
    }

    pub fn config(&self) -> &RelayConfiguration {
        &self.config
    }

    /// `Running` only while the relay loop is live; a faulted session reads as `Idle`.
    pub fn state(&self) -> RelayState {
        if self.live_session().is_some() {
            RelayState::Running
        } else {
            RelayState::Idle
        }
    }

    /// Whether the running session captures from `id`.
    pub fn is_capturing_from(&self, id: &DeviceId) -> bool {
        self.live_session()
            .and_then(|s| s.roster.source.as_ref())
            .is_some_and(|source| source.id() == id)
    }

    /// Tear down a session whose relay loop failed. Returns `true` if one was reaped.
    ///
    /// The endpoints and leases of a faulted session stay held until this,
    /// `start` or `stop` runs.
    pub fn reap_faulted(&mut self) -> bool {
        let faulted = self.session.as_ref().is_some_and(ActiveSession::faulted);
        if faulted {
            self.end_session();
        }
        faulted
    }

    /// Open every endpoint and launch the relay thread. Transitions: idle → running.
    ///
    /// Returns the negotiated format. On any activation failure the endpoints
    /// opened so far are released and the engine stays idle.
    pub fn start(
        &mut self,
        backend: Arc<dyn AudioBackend>,
        roster: Roster,
    ) -> Result<StreamFormat, RelayError> {
        self.reap_faulted();
        if self.session.is_some() {
            return Err(RelayError::PreconditionNotMet(Precondition::AlreadyRunning));
        }
        let Some(source) = roster.source.as_ref() else {
            return Err(RelayError::PreconditionNotMet(Precondition::NoSource));
        };
        if roster.targets.is_empty() {
            return Err(RelayError::PreconditionNotMet(Precondition::NoTargets));
        }

        let endpoints = self.open_endpoints(source, &roster.targets)?;
        let format = *endpoints.capture.format();
        let counters = Arc::new(SessionCounters::new(
            roster.targets.iter().map(|t| t.id().clone()),
        ));

        // Endpoints are handed over after the spawn succeeds, so a failed
        // spawn still goes through teardown.
        let (handoff, receive) = mpsc::sync_channel::<SessionEndpoints>(1);
        self.running.store(true, Ordering::Release);

        let running = Arc::clone(&self.running);
        let thread_counters = Arc::clone(&counters);
        let delegate = self.delegate.clone();
        let poll_interval = self.config.poll_interval;
        let elevate = self.config.elevate_priority;

        let spawned = thread::Builder::new()
            .name("audio-relay".into())
            .spawn(move || {
                let _thread_guard = backend.enter_relay_thread(elevate);
                let mut endpoints = receive.recv().ok()?;

                let result = run_loop(
                    &running,
                    endpoints.capture.as_mut(),
                    &mut endpoints.renders,
                    &thread_counters,
                    poll_interval,
                );
                if let Err(e) = result {
                    log::error!("relay loop stopped: {}", e);
                    thread_counters.faulted.store(true, Ordering::Release);
                    running.store(false, Ordering::Release);
                    if let Some(delegate) = &delegate {
                        delegate.on_error(&e);
                    }
                }
                Some(endpoints)
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.running.store(false, Ordering::Release);
                endpoints.teardown();
                return Err(RelayError::backend(format!("failed to spawn relay thread: {}", e)));
            }
        };
        if let Err(mpsc::SendError(endpoints)) = handoff.send(endpoints) {
            endpoints.teardown();
        }

        let id = Uuid::new_v4();
        log::info!(
            "relay {} started: {} -> {} target(s), {}",
            id,
            source.id(),
            roster.targets.len(),
            format
        );

        self.session = Some(ActiveSession {
            id,
            started_at: Utc::now(),
            format,
            roster,
            counters,
            handle,
        });
        self.notify(RelayState::Running);
        Ok(format)
    }

    /// Stop the relay thread, wait for it, then release every endpoint.
    /// Transitions: running → idle.
    ///
    /// Returns `false` if no session was running, including one whose loop
    /// already failed; that session is still torn down. Must not be called
    /// from the relay thread.
    pub fn stop(&mut self) -> bool {
        let was_live = self.live_session().is_some();
        self.end_session();
        was_live
    }

    /// Counters of the current session, if any. Still reported after a fault
    /// until the session is reaped.
    pub fn diagnostics(&self) -> Option<RelayDiagnostics> {
        let session = self.session.as_ref()?;
        let source = session.roster.source.as_ref()?;
        let counters = &session.counters;
        Some(RelayDiagnostics {
            session_id: session.id.to_string(),
            started_at: session.started_at.to_rfc3339(),
            source: source.id().clone(),
            format: session.format,
            packets_captured: counters.packets.load(Ordering::Relaxed),
            frames_captured: counters.frames.load(Ordering::Relaxed),
            discontinuities: counters.discontinuities.load(Ordering::Relaxed),
            faulted: counters.faulted.load(Ordering::Acquire),
            targets: counters.targets.iter().map(|t| t.snapshot()).collect(),
        })
    }

    fn live_session(&self) -> Option<&ActiveSession> {
        self.session.as_ref().filter(|s| !s.faulted())
    }

    fn end_session(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let ActiveSession {
            id,
            roster,
            counters,
            handle,
            ..
        } = session;

        self.running.store(false, Ordering::Release);
        match handle.join() {
            Ok(Some(endpoints)) => endpoints.teardown(),
            Ok(None) => {}
            Err(_) => log::error!("relay thread {} panicked; endpoints released during unwind", id),
        }

        let Roster { source, mut targets } = roster;
        while let Some(target) = targets.pop() {
            drop(target);
        }
        drop(source);

        log::info!(
            "relay {} stopped after {} packets",
            id,
            counters.packets.load(Ordering::Relaxed)
        );
        self.notify(RelayState::Idle);
    }

    fn open_endpoints(
        &self,
        source: &DeviceLease,
        targets: &[DeviceLease],
    ) -> Result<SessionEndpoints, RelayError> {
        let buffer_duration = self.config.buffer_duration;
        let capture = source
            .device()
            .open_loopback_capture(buffer_duration)
            .map_err(|e| as_activation_failure(source.id(), e))?;
        let format = *capture.format();

        let mut endpoints = SessionEndpoints {
            capture,
            renders: Vec::with_capacity(targets.len()),
        };
        for target in targets {
            match target.device().open_render(&format, buffer_duration) {
                Ok(render) => endpoints.renders.push(render),
                Err(e) => {
                    endpoints.teardown();
                    return Err(as_activation_failure(target.id(), e));
                }
            }
        }

        if let Err(e) = endpoints.capture.start() {
            endpoints.teardown();
            return Err(as_activation_failure(source.id(), e));
        }
        let started = endpoints
            .renders
            .iter_mut()
            .zip(targets)
            .try_for_each(|(render, target)| {
                render
                    .start()
                    .map_err(|e| as_activation_failure(target.id(), e))
            });
        if let Err(e) = started {
            endpoints.teardown();
            return Err(e);
        }

        Ok(endpoints)
    }

    fn notify(&self, state: RelayState) {
        if let Some(delegate) = &self.delegate {
            delegate.on_state_changed(state);
        }
    }
}

impl Drop for RelayEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn as_activation_failure(device: &DeviceId, error: RelayError) -> RelayError {
    match error {
        RelayError::ActivationFailure { .. } => error,
        other => RelayError::activation(device, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use parking_lot::Mutex;

    use super::*;
    use crate::devices::arena::DeviceArena;
    use crate::testing::{MockBackend, MockDevice};
    use crate::traits::backend::PlaybackDevice;

    fn test_config() -> RelayConfiguration {
        RelayConfiguration {
            poll_interval: Duration::from_micros(50),
            ..Default::default()
        }
    }

    struct Fixture {
        backend: Arc<MockBackend>,
        arena: DeviceArena,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                backend: Arc::new(MockBackend::new()),
                arena: DeviceArena::new(),
            }
        }

        fn lease(&self, device: &Arc<MockDevice>) -> DeviceLease {
            self.arena.lease(Arc::clone(device) as Arc<dyn PlaybackDevice>)
        }

        fn roster(&self, source: &Arc<MockDevice>, targets: &[&Arc<MockDevice>]) -> Roster {
            Roster {
                source: Some(self.lease(source)),
                targets: targets.iter().map(|t| self.lease(t)).collect(),
            }
        }

        fn backend(&self) -> Arc<dyn AudioBackend> {
            Arc::clone(&self.backend) as Arc<dyn AudioBackend>
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for relay");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn start_without_source_is_precondition() {
        let fx = Fixture::new();
        let target = fx.backend.add(MockDevice::new("t", "Target"));
        let mut engine = RelayEngine::new(test_config());

        let roster = Roster {
            source: None,
            targets: vec![fx.lease(&target)],
        };
        assert_eq!(
            engine.start(fx.backend(), roster).unwrap_err(),
            RelayError::PreconditionNotMet(Precondition::NoSource)
        );
        assert_eq!(engine.state(), RelayState::Idle);
        assert_eq!(fx.backend.tracker().open_count(), 0);
    }

    #[test]
    fn start_without_targets_is_precondition() {
        let fx = Fixture::new();
        let source = fx.backend.add(MockDevice::new("s", "Source"));
        let mut engine = RelayEngine::new(test_config());

        let err = engine.start(fx.backend(), fx.roster(&source, &[])).unwrap_err();
        assert_eq!(err, RelayError::PreconditionNotMet(Precondition::NoTargets));
        assert!(engine.state().is_idle());
    }

    #[test]
    fn start_twice_is_precondition() {
        let fx = Fixture::new();
        let source = fx.backend.add(MockDevice::new("s", "Source").with_packet_limit(0));
        let target = fx.backend.add(MockDevice::new("t", "Target"));
        let mut engine = RelayEngine::new(test_config());

        engine.start(fx.backend(), fx.roster(&source, &[&target])).unwrap();
        assert_eq!(
            engine.start(fx.backend(), fx.roster(&source, &[&target])).unwrap_err(),
            RelayError::PreconditionNotMet(Precondition::AlreadyRunning)
        );
        assert!(engine.state().is_running());
        assert_eq!(fx.backend.tracker().open_count(), 2);
        engine.stop();
    }

    #[test]
    fn start_then_stop_twice_leaves_nothing_open() {
        let fx = Fixture::new();
        let source = fx.backend.add(MockDevice::new("s", "Source"));
        let a = fx.backend.add(MockDevice::new("a", "A"));
        let b = fx.backend.add(MockDevice::new("b", "B"));
        let mut engine = RelayEngine::new(test_config());

        let format = engine.start(fx.backend(), fx.roster(&source, &[&a, &b])).unwrap();
        assert_eq!(format, StreamFormat::float32(48000, 2));
        assert_eq!(fx.backend.tracker().open_count(), 3);

        assert!(engine.stop());
        assert!(!engine.stop());
        assert_eq!(engine.state(), RelayState::Idle);
        assert_eq!(fx.backend.tracker().open_count(), 0);
        assert!(fx.arena.is_empty());
    }

    #[test]
    fn teardown_runs_in_reverse_acquisition_order() {
        let fx = Fixture::new();
        let source = fx.backend.add(MockDevice::new("s", "Source").with_packet_limit(0));
        let a = fx.backend.add(MockDevice::new("a", "A"));
        let b = fx.backend.add(MockDevice::new("b", "B"));
        let mut engine = RelayEngine::new(test_config());

        engine.start(fx.backend(), fx.roster(&source, &[&a, &b])).unwrap();
        fx.backend.tracker().clear_events();
        engine.stop();

        assert_eq!(
            fx.backend.tracker().events(),
            vec![
                "stop render b",
                "close render b",
                "stop render a",
                "close render a",
                "stop capture s",
                "close capture s",
            ]
        );
    }

    #[test]
    fn render_activation_failure_releases_opened_endpoints() {
        let fx = Fixture::new();
        let source = fx.backend.add(MockDevice::new("s", "Source"));
        let good = fx.backend.add(MockDevice::new("good", "Good"));
        let bad = fx.backend.add(MockDevice::new("bad", "Bad").failing_render());
        let mut engine = RelayEngine::new(test_config());

        let err = engine
            .start(fx.backend(), fx.roster(&source, &[&good, &bad]))
            .unwrap_err();

        assert!(matches!(err, RelayError::ActivationFailure { ref device, .. } if device.as_str() == "bad"));
        assert!(engine.state().is_idle());
        assert_eq!(fx.backend.tracker().open_count(), 0);
        assert_eq!(fx.backend.relay_thread_entries(), 0);
        assert!(fx.arena.is_empty());
    }

    #[test]
    fn capture_activation_failure_stays_idle() {
        let fx = Fixture::new();
        let source = fx.backend.add(MockDevice::new("s", "Source").failing_capture());
        let target = fx.backend.add(MockDevice::new("t", "Target"));
        let mut engine = RelayEngine::new(test_config());

        let err = engine
            .start(fx.backend(), fx.roster(&source, &[&target]))
            .unwrap_err();
        assert!(matches!(err, RelayError::ActivationFailure { .. }));
        assert!(engine.state().is_idle());
        assert_eq!(fx.backend.tracker().open_count(), 0);
    }

    #[test]
    fn overrun_target_never_blocks_others() {
        let fx = Fixture::new();
        let source = fx.backend.add(
            MockDevice::new("s", "Source")
                .with_packet_frames(480)
                .with_packet_limit(1500),
        );
        let starved = fx.backend.add(MockDevice::new("starved", "Starved").with_render_buffer(100));
        let healthy = fx.backend.add(MockDevice::new("healthy", "Healthy"));
        let mut engine = RelayEngine::new(test_config());

        engine
            .start(fx.backend(), fx.roster(&source, &[&starved, &healthy]))
            .unwrap();
        wait_for(|| engine.diagnostics().unwrap().packets_captured >= 1500);

        let diagnostics = engine.diagnostics().unwrap();
        assert!(!diagnostics.faulted);
        assert_eq!(diagnostics.targets[0].packets_delivered, 0);
        assert_eq!(diagnostics.targets[0].packets_dropped, 1500);
        assert_eq!(diagnostics.targets[1].packets_delivered, 1500);
        assert_eq!(healthy.render_stats().writes(), 1500);
        assert_eq!(starved.render_stats().writes(), 0);

        assert!(engine.stop());
        assert_eq!(fx.backend.tracker().open_count(), 0);
    }

    #[test]
    fn relay_thread_requests_priority() {
        let fx = Fixture::new();
        let source = fx.backend.add(MockDevice::new("s", "Source").with_packet_limit(0));
        let target = fx.backend.add(MockDevice::new("t", "Target"));

        let mut engine = RelayEngine::new(test_config());
        engine.start(fx.backend(), fx.roster(&source, &[&target])).unwrap();
        wait_for(|| fx.backend.relay_thread_entries() == 1);
        engine.stop();
        assert_eq!(fx.backend.elevation_requests(), 1);

        let mut engine = RelayEngine::new(RelayConfiguration {
            elevate_priority: false,
            ..test_config()
        });
        engine.start(fx.backend(), fx.roster(&source, &[&target])).unwrap();
        wait_for(|| fx.backend.relay_thread_entries() == 2);
        engine.stop();
        assert_eq!(fx.backend.elevation_requests(), 1);
    }

    #[derive(Default)]
    struct RecordingDelegate {
        states: Mutex<Vec<RelayState>>,
        errors: Mutex<Vec<RelayError>>,
    }

    impl RelayDelegate for RecordingDelegate {
        fn on_state_changed(&self, state: RelayState) {
            self.states.lock().push(state);
        }

        fn on_error(&self, error: &RelayError) {
            self.errors.lock().push(error.clone());
        }
    }

    #[test]
    fn delegate_sees_transitions() {
        let fx = Fixture::new();
        let source = fx.backend.add(MockDevice::new("s", "Source").with_packet_limit(0));
        let target = fx.backend.add(MockDevice::new("t", "Target"));
        let delegate = Arc::new(RecordingDelegate::default());

        let mut engine = RelayEngine::new(test_config());
        engine.set_delegate(delegate.clone());
        engine.start(fx.backend(), fx.roster(&source, &[&target])).unwrap();
        engine.stop();
        engine.stop();

        assert_eq!(*delegate.states.lock(), vec![RelayState::Running, RelayState::Idle]);
        assert!(delegate.errors.lock().is_empty());
    }

    #[test]
    fn capture_fault_returns_engine_to_idle() {
        let fx = Fixture::new();
        let source = fx.backend.add(MockDevice::new("s", "Source").failing_capture_after(3));
        let target = fx.backend.add(MockDevice::new("t", "Target"));
        let delegate = Arc::new(RecordingDelegate::default());

        let mut engine = RelayEngine::new(test_config());
        engine.set_delegate(delegate.clone());
        engine.start(fx.backend(), fx.roster(&source, &[&target])).unwrap();
        wait_for(|| !delegate.errors.lock().is_empty());

        let diagnostics = engine.diagnostics().unwrap();
        assert!(diagnostics.faulted);
        assert_eq!(diagnostics.packets_captured, 3);
        assert_eq!(engine.state(), RelayState::Idle);
        assert!(!engine.is_capturing_from(source.id()));
        assert_eq!(
            *delegate.errors.lock(),
            vec![RelayError::backend("AUDCLNT_E_DEVICE_INVALIDATED")]
        );

        // The failed session is torn down before the new one opens.
        let healthy = fx.backend.add(MockDevice::new("h", "Healthy").with_packet_limit(0));
        engine.start(fx.backend(), fx.roster(&healthy, &[&target])).unwrap();
        assert!(engine.state().is_running());
        assert_eq!(fx.backend.tracker().open_count(), 2);
        assert_eq!(
            *delegate.states.lock(),
            vec![RelayState::Running, RelayState::Idle, RelayState::Running]
        );

        assert!(engine.stop());
        assert_eq!(fx.backend.tracker().open_count(), 0);
        assert!(fx.arena.is_empty());
        assert_eq!(delegate.errors.lock().len(), 1);
    }

    #[test]
    fn stop_after_fault_releases_endpoints() {
        let fx = Fixture::new();
        let source = fx.backend.add(MockDevice::new("s", "Source").failing_capture_after(0));
        let target = fx.backend.add(MockDevice::new("t", "Target"));

        let mut engine = RelayEngine::new(test_config());
        engine.start(fx.backend(), fx.roster(&source, &[&target])).unwrap();
        wait_for(|| engine.state().is_idle());
        assert_eq!(fx.backend.tracker().open_count(), 2);

        assert!(!engine.stop());
        assert!(engine.diagnostics().is_none());
        assert_eq!(fx.backend.tracker().open_count(), 0);
        assert!(fx.arena.is_empty());
    }

    #[test]
    fn drop_stops_the_session() {
        let fx = Fixture::new();
        let source = fx.backend.add(MockDevice::new("s", "Source"));
        let target = fx.backend.add(MockDevice::new("t", "Target"));

        let mut engine = RelayEngine::new(test_config());
        engine.start(fx.backend(), fx.roster(&source, &[&target])).unwrap();
        drop(engine);

        assert_eq!(fx.backend.tracker().open_count(), 0);
        assert!(fx.arena.is_empty());
    }

    #[test]
    fn is_capturing_from_tracks_session_source() {
        let fx = Fixture::new();
        let source = fx.backend.add(MockDevice::new("s", "Source").with_packet_limit(0));
        let target = fx.backend.add(MockDevice::new("t", "Target"));
        let mut engine = RelayEngine::new(test_config());

        assert!(!engine.is_capturing_from(source.id()));
        engine.start(fx.backend(), fx.roster(&source, &[&target])).unwrap();
        assert!(engine.is_capturing_from(source.id()));
        assert!(!engine.is_capturing_from(target.id()));
        engine.stop();
        assert!(!engine.is_capturing_from(source.id()));
    }
}
