//! Timing configuration for realistic mode.
//!
//! Defines hardware-like delays to simulate real controllers in integration tests.

use std::time::Duration;

/// Timing configuration for realistic mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimingConfig {
    /// Extra time a motor reports Moving after reaching its target
    pub settling_time_ms: u64,
    /// Round-trip delay added to every controller call
    pub communication_delay_ms: u64,
}

impl TimingConfig {
    /// Timing config for a stepper motor controller on a serial line
    pub fn motor() -> Self {
        Self {
            settling_time_ms: 20,
            communication_delay_ms: 2,
        }
    }

    /// Timing config for a counter/timer card
    pub fn counter_timer() -> Self {
        Self {
            settling_time_ms: 0,
            communication_delay_ms: 1,
        }
    }

    /// Timing config for a slow 0D device (e.g. a multimeter)
    pub fn zerod() -> Self {
        Self {
            settling_time_ms: 0,
            communication_delay_ms: 5,
        }
    }

    pub fn settling_time(&self) -> Duration {
        Duration::from_millis(self.settling_time_ms)
    }

    pub fn communication_delay(&self) -> Duration {
        Duration::from_millis(self.communication_delay_ms)
    }
}
