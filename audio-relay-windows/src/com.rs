//! COM apartment setup shared by the backend and the relay thread.

use windows::Win32::Foundation::RPC_E_CHANGED_MODE;
use windows::Win32::System::Com::{CoInitializeEx, CoUninitialize, COINIT_MULTITHREADED};

use audio_relay_core::RelayError;

/// Balances a successful `CoInitializeEx` on the thread that created it.
///
/// If the thread already lives in a single-threaded apartment, nothing is
/// initialized and nothing is undone on drop.
pub struct ComGuard {
    initialized: bool,
}

/// Join the multithreaded apartment on the calling thread.
pub fn initialize_mta() -> Result<ComGuard, RelayError> {
    let hr = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };
    if hr == RPC_E_CHANGED_MODE {
        log::debug!("COM already initialized as STA on this thread");
        return Ok(ComGuard { initialized: false });
    }
    hr.ok()
        .map_err(|e| RelayError::backend(format!("CoInitializeEx failed: {}", e)))?;
    Ok(ComGuard { initialized: true })
}

impl Drop for ComGuard {
    fn drop(&mut self) {
        if self.initialized {
            unsafe {
                CoUninitialize();
            }
        }
    }
}
