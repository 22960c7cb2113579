use std::time::Duration;

/// Configuration for a relay context.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfiguration {
    /// Requested endpoint buffer duration (default: 2 ms).
    ///
    /// Shared-mode endpoints round this up to the engine's minimum period.
    pub buffer_duration: Duration,

    /// Sleep between polls when no capture packet is ready (default: 500 µs).
    pub poll_interval: Duration,

    /// Ask the platform for real-time scheduling on the relay thread (default: true).
    pub elevate_priority: bool,

    /// Global volume multiplier at construction, in [0, 1] (default: 1.0).
    pub initial_global_volume: f32,
}

impl RelayConfiguration {
    pub fn validate(&self) -> Result<(), String> {
        if self.buffer_duration.is_zero() {
            return Err("buffer duration must be positive".into());
        }
        if self.poll_interval.is_zero() {
            return Err("poll interval must be positive".into());
        }
        if !(0.0..=1.0).contains(&self.initial_global_volume) {
            return Err(format!(
                "global volume out of range: {}",
                self.initial_global_volume
            ));
        }
        Ok(())
    }
}

impl Default for RelayConfiguration {
    fn default() -> Self {
        Self {
            buffer_duration: Duration::from_millis(2),
            poll_interval: Duration::from_micros(500),
            elevate_priority: true,
            initial_global_volume: 1.0,
        }
    }
}
