//! Pool tunables.
//!
//! Loaded as the `[pool]` table of the application configuration; every field
//! has a default so an empty table is valid.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing and sizing parameters of the motion and acquisition loops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Sleep between two motion loop iterations
    pub motion_loop_sleep_ms: u64,
    /// Motion loop re-reads positions once every N state polls
    pub motion_loop_states_per_position: u32,
    /// Sleep between two acquisition loop iterations
    pub acq_loop_sleep_ms: u64,
    /// Acquisition loop re-reads values once every N state polls
    pub acq_loop_states_per_value: u32,
    /// Maximum number of controller tasks executing at once
    pub worker_threads: usize,
    /// After a stop/abort, give up waiting for settlement after this long
    pub abort_timeout_ms: u64,
    /// Consecutive failed state reads tolerated for one element before it is
    /// dropped from the running operation
    pub max_consecutive_read_errors: u32,
    /// Samples kept per 0D channel during one acquisition
    pub zerod_buffer_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            motion_loop_sleep_ms: 10,
            motion_loop_states_per_position: 5,
            acq_loop_sleep_ms: 10,
            acq_loop_states_per_value: 10,
            worker_threads: 16,
            abort_timeout_ms: 5000,
            max_consecutive_read_errors: 50,
            zerod_buffer_size: 16384,
        }
    }
}

impl PoolConfig {
    pub fn motion_loop_sleep(&self) -> Duration {
        Duration::from_millis(self.motion_loop_sleep_ms)
    }

    pub fn acq_loop_sleep(&self) -> Duration {
        Duration::from_millis(self.acq_loop_sleep_ms)
    }

    pub fn abort_timeout(&self) -> Duration {
        Duration::from_millis(self.abort_timeout_ms)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if self.motion_loop_sleep_ms == 0 {
            return Err("motion_loop_sleep_ms must be > 0".to_string());
        }
        if self.acq_loop_sleep_ms == 0 {
            return Err("acq_loop_sleep_ms must be > 0".to_string());
        }
        if self.motion_loop_states_per_position == 0 {
            return Err("motion_loop_states_per_position must be > 0".to_string());
        }
        if self.acq_loop_states_per_value == 0 {
            return Err("acq_loop_states_per_value must be > 0".to_string());
        }
        if self.worker_threads == 0 {
            return Err("worker_threads must be > 0".to_string());
        }
        if self.max_consecutive_read_errors == 0 {
            return Err("max_consecutive_read_errors must be > 0".to_string());
        }
        if self.zerod_buffer_size < 2 {
            return Err(format!(
                "Invalid zerod_buffer_size {}. Must be at least 2",
                self.zerod_buffer_size
            ));
        }
        Ok(())
    }
}
