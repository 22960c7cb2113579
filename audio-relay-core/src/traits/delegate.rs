use crate::models::error::RelayError;
use crate::models::state::RelayState;

/// Event delegate for relay notifications.
///
/// `on_state_changed` is called from the thread issuing `start`/`stop`.
/// `on_error` may be called from the relay thread; marshal to the UI thread if needed.
pub trait RelayDelegate: Send + Sync {
    fn on_state_changed(&self, state: RelayState);

    fn on_error(&self, error: &RelayError);
}
