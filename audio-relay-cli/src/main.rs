// The shell only runs against WASAPI; elsewhere it is built for its tests.
#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
mod commands;
#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
mod repl;

use std::process::ExitCode;

fn main() -> ExitCode {
    env_logger::init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("audio-relay: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(target_os = "windows")]
fn run() -> Result<(), Box<dyn std::error::Error>> {
    use audio_relay_core::{AudioRelay, RelayConfiguration};
    use audio_relay_windows::{com, WasapiBackend};

    // Outlives the relay and every COM object it holds.
    let _com = com::initialize_mta()?;

    let relay = AudioRelay::new(WasapiBackend::new()?, RelayConfiguration::default())?;
    let mut shell = repl::Repl::new(relay);
    shell.run(std::io::stdin().lock(), &mut std::io::stdout())?;
    Ok(())
}

#[cfg(not(target_os = "windows"))]
fn run() -> Result<(), Box<dyn std::error::Error>> {
    Err("loopback relay requires the Windows audio stack (WASAPI)".into())
}
