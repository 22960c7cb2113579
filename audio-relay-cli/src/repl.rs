use std::io::{self, BufRead, Write};
use std::sync::Arc;

use audio_relay_core::{
    AudioBackend, AudioRelay, DeviceId, DeviceInfo, DeviceRole, Precondition, RelayDelegate, RelayError,
    RelayState,
};

use crate::commands::{Command, HELP};

pub const PROMPT: &str = "AudioRelay> ";

/// Whether the shell keeps reading input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Reports relay-thread failures on stderr; the prompt may be mid-line.
struct ConsoleDelegate;

impl RelayDelegate for ConsoleDelegate {
    fn on_state_changed(&self, state: RelayState) {
        log::info!("relay is now {}", state);
    }

    fn on_error(&self, error: &RelayError) {
        eprintln!("\nRelay stopped: {}", error);
    }
}

/// Interactive shell over one [`AudioRelay`].
///
/// Device indices refer to the table printed by the last `show`.
pub struct Repl<B: AudioBackend + 'static> {
    relay: AudioRelay<B>,
    listing: Vec<DeviceId>,
}

impl<B: AudioBackend + 'static> Repl<B> {
    pub fn new(mut relay: AudioRelay<B>) -> Self {
        relay.set_delegate(Arc::new(ConsoleDelegate));
        let listing = relay.devices().into_iter().map(|d| d.id).collect();
        Self { relay, listing }
    }

    pub fn relay(&self) -> &AudioRelay<B> {
        &self.relay
    }

    /// Read commands from `input` until `exit` or end of input.
    pub fn run(&mut self, input: impl BufRead, out: &mut impl Write) -> io::Result<()> {
        writeln!(out, "\n{}", HELP)?;
        let mut lines = input.lines();
        loop {
            write!(out, "{}", PROMPT)?;
            out.flush()?;
            let Some(line) = lines.next() else {
                writeln!(out)?;
                break;
            };
            if self.handle_line(&line?, out)? == Flow::Exit {
                break;
            }
        }
        self.relay.shutdown();
        Ok(())
    }

    pub fn handle_line(&mut self, line: &str, out: &mut impl Write) -> io::Result<Flow> {
        match Command::parse(line) {
            Ok(command) => self.execute(command, out),
            Err(e) => {
                writeln!(out, "{}", e)?;
                Ok(Flow::Continue)
            }
        }
    }

    pub fn execute(&mut self, command: Command, out: &mut impl Write) -> io::Result<Flow> {
        match command {
            Command::Empty => {}
            Command::Show => self.show(out)?,
            Command::SetSource(index) => {
                let Some(id) = self.resolve(index) else {
                    return invalid_index(out);
                };
                match self.relay.assign_source(&id) {
                    Ok(()) => writeln!(out, "Loopback device set: {}", self.name_of(&id))?,
                    Err(RelayError::NotFound(_)) => writeln!(out, "Invalid index.")?,
                    Err(e) => report(out, &e)?,
                }
            }
            Command::AddTarget(index) => {
                let Some(id) = self.resolve(index) else {
                    return invalid_index(out);
                };
                match self.relay.assign_target(&id) {
                    Ok(()) => {
                        writeln!(out, "Output device added: {}", self.name_of(&id))?;
                        if self.relay.state().is_running() {
                            writeln!(out, "Restart the relay to include it.")?;
                        }
                    }
                    Err(RelayError::NotFound(_)) => writeln!(out, "Invalid index.")?,
                    Err(e) => report(out, &e)?,
                }
            }
            Command::Remove(index) => {
                let Some(id) = self.resolve(index) else {
                    return invalid_index(out);
                };
                match self.relay.release(&id) {
                    Ok(DeviceRole::Source) => writeln!(out, "Loopback device removed: {}", self.name_of(&id))?,
                    Ok(_) => writeln!(out, "Output device removed: {}", self.name_of(&id))?,
                    Err(RelayError::NotFound(_))
                    | Err(RelayError::PreconditionNotMet(Precondition::NotAssigned)) => {
                        writeln!(out, "Output device not found.")?
                    }
                    Err(e) => report(out, &e)?,
                }
            }
            Command::Clear => match self.relay.clear_all_targets() {
                Ok(cleared) => writeln!(out, "Removed {} output device(s).", cleared.len())?,
                Err(RelayError::PreconditionNotMet(Precondition::NothingToClear)) => {
                    writeln!(out, "No output devices to remove.")?
                }
                Err(e) => report(out, &e)?,
            },
            Command::Volume { index, percent } => {
                let Some(id) = self.resolve(index) else {
                    writeln!(out, "Invalid index or volume.")?;
                    return Ok(Flow::Continue);
                };
                match self.relay.set_device_volume(&id, percent / 100.0) {
                    Ok(effective) => writeln!(
                        out,
                        "Volume of {} set to {} (effective {}).",
                        self.name_of(&id),
                        percent_str(percent / 100.0),
                        percent_str(effective)
                    )?,
                    Err(RelayError::NotFound(_)) => writeln!(out, "Invalid index or volume.")?,
                    Err(e) => report(out, &e)?,
                }
            }
            Command::Global(percent) => {
                let stored = self.relay.set_global_volume(percent / 100.0);
                writeln!(out, "Global volume set to {}.", percent_str(stored))?;
            }
            Command::Start => match self.relay.start() {
                Ok(format) => {
                    let status = self.relay.status();
                    let source = status.source.map(|s| s.name).unwrap_or_default();
                    writeln!(out, "Relay started from {} ({})", source, format)?;
                    for target in status.targets {
                        writeln!(out, "-> {}", target.name)?;
                    }
                }
                Err(RelayError::PreconditionNotMet(Precondition::AlreadyRunning)) => {
                    writeln!(out, "Relay already running.")?
                }
                Err(RelayError::PreconditionNotMet(Precondition::NoSource | Precondition::NoTargets)) => {
                    writeln!(out, "Set loopback and at least one output device first.")?
                }
                Err(e) => report(out, &e)?,
            },
            Command::Stop => {
                if self.relay.stop() {
                    writeln!(out, "Relay stopped.")?;
                } else {
                    writeln!(out, "Relay is not running.")?;
                }
            }
            Command::Status { json } => self.status(json, out)?,
            Command::Refresh => match self.relay.refresh() {
                Ok(summary) => {
                    writeln!(
                        out,
                        "{} device(s) added, {} removed.",
                        summary.added.len(),
                        summary.dropped.len()
                    )?;
                    self.show(out)?;
                }
                Err(e) => report(out, &e)?,
            },
            Command::Help => writeln!(out, "{}", HELP)?,
            Command::Exit => return Ok(Flow::Exit),
        }
        Ok(Flow::Continue)
    }

    fn show(&mut self, out: &mut impl Write) -> io::Result<()> {
        let devices = self.relay.devices();
        writeln!(out, "Audio Output Devices:")?;
        if devices.is_empty() {
            writeln!(out, "  (none)")?;
        }
        for (index, device) in devices.iter().enumerate() {
            writeln!(out, "[{}]: {}", index, describe(device))?;
        }
        self.listing = devices.into_iter().map(|d| d.id).collect();
        Ok(())
    }

    fn status(&self, json: bool, out: &mut impl Write) -> io::Result<()> {
        let status = self.relay.status();
        if json {
            let text = serde_json::to_string_pretty(&status).map_err(io::Error::other)?;
            return writeln!(out, "{}", text);
        }

        writeln!(out, "Relay: {}", status.state)?;
        writeln!(out, "Global volume: {}", percent_str(status.global_volume))?;
        match &status.source {
            Some(source) => writeln!(out, "Loopback device: {}", source.name)?,
            None => writeln!(out, "Loopback device: (none)")?,
        }
        if status.targets.is_empty() {
            writeln!(out, "Output devices: (none)")?;
        } else {
            writeln!(out, "Output devices:")?;
            for target in &status.targets {
                writeln!(out, "  -> {}", describe(target))?;
            }
        }

        if let Some(diagnostics) = &status.diagnostics {
            writeln!(
                out,
                "Session {} since {}: {}, {} packets captured, {} discontinuities{}",
                diagnostics.session_id,
                diagnostics.started_at,
                diagnostics.format,
                diagnostics.packets_captured,
                diagnostics.discontinuities,
                if diagnostics.faulted { " (faulted)" } else { "" }
            )?;
            for target in &diagnostics.targets {
                writeln!(
                    out,
                    "  {}: {} delivered, {} dropped",
                    self.name_of(&target.id),
                    target.packets_delivered,
                    target.packets_dropped
                )?;
            }
        }
        Ok(())
    }

    fn resolve(&self, index: usize) -> Option<DeviceId> {
        let id = self.listing.get(index)?;
        self.relay.role_of(id).map(|_| id.clone())
    }

    fn name_of(&self, id: &DeviceId) -> String {
        self.relay
            .devices()
            .into_iter()
            .find(|d| &d.id == id)
            .map_or_else(|| id.to_string(), |d| d.name)
    }
}

fn describe(device: &DeviceInfo) -> String {
    match (device.role, device.individual_volume, device.effective_volume) {
        (DeviceRole::Target, Some(individual), Some(effective)) => {
            let control = if device.has_volume_control { "" } else { ", no volume control" };
            format!(
                "{} (target, volume {}, effective {}{})",
                device.name,
                percent_str(individual),
                percent_str(effective),
                control
            )
        }
        (DeviceRole::Available, _, _) => device.name.clone(),
        (role, _, _) => format!("{} ({})", device.name, role),
    }
}

fn percent_str(volume: f32) -> String {
    format!("{:.0}%", volume * 100.0)
}

fn invalid_index(out: &mut impl Write) -> io::Result<Flow> {
    writeln!(out, "Invalid index.")?;
    Ok(Flow::Continue)
}

fn report(out: &mut impl Write, error: &RelayError) -> io::Result<()> {
    log::debug!("command failed: {:?}", error);
    writeln!(out, "Error: {}", error)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use audio_relay_core::testing::{MockBackend, MockDevice};
    use audio_relay_core::RelayConfiguration;

    use super::*;

    fn repl() -> Repl<MockBackend> {
        let backend = MockBackend::new();
        backend.add(MockDevice::new("spk", "Speakers"));
        backend.add(MockDevice::new("hp", "Headphones").with_volume(0.5));
        backend.add(MockDevice::new("hdmi", "HDMI").without_volume_control());
        Repl::new(AudioRelay::new(backend, RelayConfiguration::default()).unwrap())
    }

    fn run(repl: &mut Repl<MockBackend>, line: &str) -> String {
        let mut out = Vec::new();
        repl.handle_line(line, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn show_lists_devices_with_indices() {
        let mut repl = repl();
        let text = run(&mut repl, "show");
        assert!(text.contains("[0]: Speakers"));
        assert!(text.contains("[1]: Headphones"));
        assert!(text.contains("[2]: HDMI"));
    }

    #[test]
    fn louder_target_shows_volume_above_full() {
        let mut repl = repl();
        run(&mut repl, "global 40");
        run(&mut repl, "add 0");
        let text = run(&mut repl, "show");
        assert!(text.contains("[0]: Speakers (target, volume 250%, effective 100%)"));
    }

    #[test]
    fn indices_follow_last_listing() {
        let mut repl = repl();
        run(&mut repl, "show");
        assert!(run(&mut repl, "set 1").contains("Loopback device set: Headphones"));
        assert!(run(&mut repl, "add 0").contains("Output device added: Speakers"));

        // The table is unchanged until the next `show`.
        assert!(run(&mut repl, "add 2").contains("Output device added: HDMI"));
        let text = run(&mut repl, "show");
        assert!(text.contains("[0]: Headphones (source)"));
        assert!(text.contains("[1]: Speakers (target, volume 100%, effective 100%)"));
        assert!(text.contains("[2]: HDMI (target, volume 100%, effective 100%, no volume control)"));
    }

    #[test]
    fn invalid_index_and_unknown_command() {
        let mut repl = repl();
        assert_eq!(run(&mut repl, "set 9"), "Invalid index.\n");
        assert_eq!(run(&mut repl, "add 3"), "Invalid index.\n");
        assert_eq!(run(&mut repl, "volume 7 50"), "Invalid index or volume.\n");
        assert_eq!(run(&mut repl, "dance"), "Unknown command.\n");
        assert_eq!(run(&mut repl, "global"), "Usage: global <0-100>\n");
        assert_eq!(run(&mut repl, ""), "");
    }

    #[test]
    fn clear_with_no_targets() {
        let mut repl = repl();
        assert_eq!(run(&mut repl, "clear"), "No output devices to remove.\n");
        run(&mut repl, "add 0");
        run(&mut repl, "add 1");
        assert_eq!(run(&mut repl, "clear"), "Removed 2 output device(s).\n");
    }

    #[test]
    fn remove_unassigned_device() {
        let mut repl = repl();
        assert_eq!(run(&mut repl, "remove 0"), "Output device not found.\n");
        run(&mut repl, "add 0");
        assert_eq!(run(&mut repl, "remove 0"), "Output device removed: Speakers\n");
    }

    #[test]
    fn volumes_are_percentages() {
        let mut repl = repl();
        run(&mut repl, "add 1");
        assert_eq!(run(&mut repl, "global 50"), "Global volume set to 50%.\n");
        assert_eq!(
            run(&mut repl, "volume 1 80"),
            "Volume of Headphones set to 80% (effective 40%).\n"
        );
        assert_eq!(run(&mut repl, "global 250"), "Global volume set to 100%.\n");
        assert!(run(&mut repl, "volume 0 50").contains("Invalid index or volume."));
        assert!(run(&mut repl, "add 2").contains("HDMI"));
        assert!(run(&mut repl, "volume 2 50").contains("has no endpoint volume control"));
    }

    #[test]
    fn start_and_stop() {
        let mut repl = repl();
        assert_eq!(
            run(&mut repl, "start"),
            "Set loopback and at least one output device first.\n"
        );
        run(&mut repl, "set 0");
        run(&mut repl, "add 1");

        let text = run(&mut repl, "start");
        assert!(text.starts_with("Relay started from Speakers (48000 Hz, 2 ch, 32-bit float)"));
        assert!(text.contains("-> Headphones"));
        assert_eq!(run(&mut repl, "start"), "Relay already running.\n");
        assert!(run(&mut repl, "add 2").contains("Restart the relay"));
        assert!(run(&mut repl, "set 2").contains("in use"));

        let status = run(&mut repl, "status");
        assert!(status.contains("Relay: running"));
        assert!(status.contains("Session "));

        assert_eq!(run(&mut repl, "stop"), "Relay stopped.\n");
        assert_eq!(run(&mut repl, "stop"), "Relay is not running.\n");
        assert_eq!(repl.relay().backend().tracker().open_count(), 0);
    }

    #[test]
    fn status_json_is_machine_readable() {
        let mut repl = repl();
        run(&mut repl, "set 0");
        let text = run(&mut repl, "status json");
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["state"], "idle");
        assert_eq!(value["source"]["name"], "Speakers");
    }

    #[test]
    fn refresh_picks_up_new_devices() {
        let mut repl = repl();
        repl.relay().backend().add(MockDevice::new("usb", "USB DAC"));
        let text = run(&mut repl, "refresh");
        assert!(text.contains("1 device(s) added, 0 removed."));
        assert!(text.contains("[3]: USB DAC"));
    }

    #[test]
    fn run_reads_until_exit_and_shuts_down() {
        let mut repl = repl();
        let input = Cursor::new("set 0\nadd 1\nstart\nexit\nshow\n");
        let mut out = Vec::new();
        repl.run(input, &mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains(PROMPT));
        assert!(text.contains("Relay started"));
        assert!(!text.contains("Audio Output Devices:"));
        assert!(repl.relay().state().is_idle());
        assert!(repl.relay().devices().is_empty());
        assert_eq!(repl.relay().backend().tracker().open_count(), 0);
    }

    #[test]
    fn run_stops_at_end_of_input() {
        let mut repl = repl();
        let mut out = Vec::new();
        repl.run(Cursor::new("help\n"), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.matches(PROMPT).count(), 2);
    }
}
