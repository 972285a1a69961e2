//! Operational modes for the dummy controllers.
//!
//! - **Instant**: motions and acquisitions complete after a fixed number of
//!   state polls, no delays; deterministic for unit tests
//! - **Realistic**: wall-clock timing from a velocity profile or preset time
//! - **Chaos**: realistic timing plus the configured random failures

use serde::Deserialize;

/// Operational modes for dummy controllers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MockMode {
    /// Poll-count driven, no delays - for unit tests
    #[default]
    Instant,
    /// Hardware-like timing - for integration tests and demos
    Realistic,
    /// Realistic timing with injected failures - for resilience testing
    Chaos,
}

impl MockMode {
    /// True when timing follows the wall clock rather than the poll count.
    pub fn is_timed(self) -> bool {
        !matches!(self, MockMode::Instant)
    }
}
