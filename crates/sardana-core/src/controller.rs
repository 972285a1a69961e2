//! Controller driver contract.
//!
//! A controller owns one or more axes (1-based) of one kind of device. The
//! pool never talks to a device directly; it batches axis calls per controller
//! using the `*All`/`*One` protocol below:
//!
//! ```text
//! state:  PreStateAll -> PreStateOne(axis)* -> StateAll -> StateOne(axis)*
//! read:   PreReadAll  -> PreReadOne(axis)*  -> ReadAll  -> ReadOne(axis)*
//! start:  PreStartAll -> PreStartOne(axis)* -> StartOne(axis)* -> StartAll
//! load:   PreLoadAll  -> PreLoadOne(axis)*  -> LoadOne(axis)*  -> LoadAll
//! ```
//!
//! All methods except `state_one`, `read_one` and `abort_one` have no-op
//! defaults, so a minimal driver only implements what its hardware needs.
//! Optional capabilities are advertised through [`ControllerFeatures`] rather
//! than probed at runtime.

use crate::state::State;
use anyhow::Result;
use async_trait::async_trait;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// 1-based axis number within a controller.
pub type Axis = u32;

bitflags! {
    /// Capabilities a controller advertises to the pool.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ControllerFeatures: u32 {
        /// Controller drives motors
        const MOTOR = 1 << 0;
        /// Controller drives counter/timer channels
        const COUNTER_TIMER = 1 << 1;
        /// Controller drives 0D channels
        const ZERO_D = 1 << 2;
        /// Hardware applies backlash itself; the pool must not add its own pass
        const BACKLASH = 1 << 3;
        /// Targets must be rounded to whole steps before being sent
        const ROUNDING = 1 << 4;
        /// `define_position` is supported
        const DEFINE_POSITION = 1 << 5;
    }
}

/// Limit switch bits reported in [`StateInfo::limit_switches`].
pub mod limit_switches {
    pub const HOME: u8 = 1;
    pub const UPPER: u8 = 2;
    pub const LOWER: u8 = 4;
}

/// State of one axis as reported by a controller.
///
/// `error` is set by the pool, never by drivers: it marks an entry that was
/// synthesized because the controller failed to answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateInfo {
    pub state: State,
    pub status: Option<String>,
    pub limit_switches: u8,
    #[serde(default)]
    pub error: bool,
}

impl StateInfo {
    pub fn new(state: State) -> Self {
        Self {
            state,
            status: None,
            limit_switches: 0,
            error: false,
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_limit_switches(mut self, switches: u8) -> Self {
        self.limit_switches = switches;
        self
    }

    /// Fault entry standing in for an axis whose controller could not be read.
    pub fn fault(status: impl Into<String>) -> Self {
        Self {
            state: State::Fault,
            status: Some(status.into()),
            limit_switches: 0,
            error: true,
        }
    }

    pub fn status_str(&self) -> &str {
        self.status.as_deref().unwrap_or("")
    }
}

impl From<State> for StateInfo {
    fn from(state: State) -> Self {
        StateInfo::new(state)
    }
}

/// Axis-oriented controller driver.
///
/// Implementations are owned by the pool behind a mutex, so all calls into one
/// controller are serialized; different controllers are called concurrently.
#[async_trait]
pub trait Controller: Send + Sync {
    /// Short type name used in logs and error messages.
    fn controller_type(&self) -> &str;

    fn features(&self) -> ControllerFeatures {
        ControllerFeatures::empty()
    }

    /// Liveness check consulted after a failed call to tell "unreachable"
    /// apart from "unexpected driver error".
    fn is_online(&self) -> bool {
        true
    }

    async fn add_device(&mut self, _axis: Axis) -> Result<()> {
        Ok(())
    }

    async fn delete_device(&mut self, _axis: Axis) -> Result<()> {
        Ok(())
    }

    // --- state ---------------------------------------------------------------

    async fn pre_state_all(&mut self) -> Result<()> {
        Ok(())
    }

    async fn pre_state_one(&mut self, _axis: Axis) -> Result<()> {
        Ok(())
    }

    async fn state_all(&mut self) -> Result<()> {
        Ok(())
    }

    async fn state_one(&mut self, axis: Axis) -> Result<StateInfo>;

    // --- read ----------------------------------------------------------------

    async fn pre_read_all(&mut self) -> Result<()> {
        Ok(())
    }

    async fn pre_read_one(&mut self, _axis: Axis) -> Result<()> {
        Ok(())
    }

    async fn read_all(&mut self) -> Result<()> {
        Ok(())
    }

    async fn read_one(&mut self, axis: Axis) -> Result<f64>;

    // --- start ---------------------------------------------------------------

    async fn pre_start_all(&mut self) -> Result<()> {
        Ok(())
    }

    /// Returns `false` to veto the start of the whole batch.
    async fn pre_start_one(&mut self, _axis: Axis, _target: f64) -> Result<bool> {
        Ok(true)
    }

    async fn start_one(&mut self, _axis: Axis, _target: f64) -> Result<()> {
        Ok(())
    }

    async fn start_all(&mut self) -> Result<()> {
        Ok(())
    }

    // --- load (counter/timer presets) -----------------------------------------

    async fn pre_load_all(&mut self) -> Result<()> {
        Ok(())
    }

    /// `value > 0` is an integration time in seconds, `value < 0` a monitor count.
    async fn pre_load_one(&mut self, _axis: Axis, _value: f64) -> Result<bool> {
        Ok(true)
    }

    async fn load_one(&mut self, _axis: Axis, _value: f64) -> Result<()> {
        Ok(())
    }

    async fn load_all(&mut self) -> Result<()> {
        Ok(())
    }

    // --- stop / abort --------------------------------------------------------

    async fn stop_one(&mut self, axis: Axis) -> Result<()> {
        self.abort_one(axis).await
    }

    async fn stop_all(&mut self) -> Result<()> {
        Ok(())
    }

    async fn abort_one(&mut self, axis: Axis) -> Result<()>;

    async fn abort_all(&mut self) -> Result<()> {
        Ok(())
    }

    async fn define_position(&mut self, _axis: Axis, _dial: f64) -> Result<()> {
        anyhow::bail!("{} does not support define_position", self.controller_type())
    }
}

/// Builds controllers of one type from their configuration table.
///
/// The `type` field of a `[[controllers]]` entry selects the factory:
///
/// ```toml
/// [[controllers]]
/// name = "motctrl01"
/// type = "dummy_motor"   # matches controller_type() returning "dummy_motor"
/// ```
pub trait ControllerFactory: Send + Sync + 'static {
    /// Type name used in the configuration `type` field.
    fn controller_type(&self) -> &'static str;

    /// Human-readable name for listings and error messages.
    fn name(&self) -> &'static str;

    /// Capabilities every controller built by this factory advertises.
    fn features(&self) -> ControllerFeatures {
        ControllerFeatures::empty()
    }

    /// Checks the configuration table without building anything.
    fn validate(&self, config: &toml::Value) -> Result<()>;

    fn build(&self, config: toml::Value) -> Result<Box<dyn Controller>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OnlyRequired;

    #[async_trait]
    impl Controller for OnlyRequired {
        fn controller_type(&self) -> &str {
            "only_required"
        }

        async fn state_one(&mut self, _axis: Axis) -> Result<StateInfo> {
            Ok(StateInfo::new(State::On))
        }

        async fn read_one(&mut self, axis: Axis) -> Result<f64> {
            Ok(axis as f64)
        }

        async fn abort_one(&mut self, _axis: Axis) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_defaults_allow_start() {
        let mut ctrl = OnlyRequired;
        assert!(ctrl.pre_start_one(1, 3.0).await.unwrap());
        assert!(ctrl.stop_one(1).await.is_ok());
        assert!(ctrl.define_position(1, 0.0).await.is_err());
        assert!(ctrl.features().is_empty());
    }

    #[test]
    fn test_fault_entry_is_marked() {
        let info = StateInfo::fault("boom");
        assert_eq!(info.state, State::Fault);
        assert!(info.error);
        assert_eq!(info.status_str(), "boom");
        assert!(!StateInfo::new(State::On).error);
    }
}
