//! Simulated controllers for the sardana device pool
//!
//! This crate provides controllers that behave like real motor, counter/timer
//! and 0D hardware without any device attached. All timing uses
//! `tokio::time`, so tests can run with a paused clock.
//!
//! # Available Controllers
//!
//! - [`DummyMotorController`] - motors with a trapezoidal velocity profile,
//!   limit switches and scripted failures
//! - [`DummyCounterTimerController`] - timer/monitor master with counting slaves
//! - [`DummyZeroDController`] - always-ready 0D channels with scripted or noisy values
//!
//! # Modes
//!
//! - Instant: motions and acquisitions complete after a fixed number of state
//!   polls; the default, deterministic for unit tests
//! - Realistic: wall-clock durations
//! - Chaos: realistic plus random failures
//!
//! # Factory Pattern
//!
//! Each controller has a [`ControllerFactory`] so the application can build it
//! from a configuration table:
//!
//! ```rust,ignore
//! use sardana_driver_mock::register_all;
//!
//! let registry = ControllerRegistry::new();
//! register_all(&registry);
//! let ctrl = registry.build("dummy_motor", config)?;
//! ```

pub mod common;
mod dummy_counter_timer;
mod dummy_motor;
mod dummy_zerod;

use anyhow::Result;
use sardana_core::{Controller, ControllerFactory, ControllerFeatures};

// Re-export common types
pub use common::{
    CallLog, ControllerCall, ErrorConfig, ErrorScenario, MockMode, MockRng, TimingConfig,
};

// Re-export controller types
pub use dummy_counter_timer::{DummyCounterTimerConfig, DummyCounterTimerController};
pub use dummy_motor::{
    DummyMotorConfig, DummyMotorController, DummyMotorControllerBuilder, VelocityProfile,
};
pub use dummy_zerod::{DummyZeroDConfig, DummyZeroDController};

// =============================================================================
// Factories
// =============================================================================

/// Factory for [`DummyMotorController`] (`type = "dummy_motor"`).
pub struct DummyMotorFactory;

impl ControllerFactory for DummyMotorFactory {
    fn controller_type(&self) -> &'static str {
        "dummy_motor"
    }

    fn name(&self) -> &'static str {
        "Dummy Motor Controller"
    }

    fn features(&self) -> ControllerFeatures {
        ControllerFeatures::MOTOR | ControllerFeatures::DEFINE_POSITION
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: DummyMotorConfig = config.clone().try_into()?;
        if cfg.max_velocity <= 0.0 || cfg.acceleration <= 0.0 {
            anyhow::bail!("max_velocity and acceleration must be > 0");
        }
        if let (Some(lower), Some(upper)) = (cfg.lower_limit, cfg.upper_limit) {
            if lower >= upper {
                anyhow::bail!("lower_limit {} must be below upper_limit {}", lower, upper);
            }
        }
        Ok(())
    }

    fn build(&self, config: toml::Value) -> Result<Box<dyn Controller>> {
        let cfg: DummyMotorConfig = config.try_into()?;
        Ok(Box::new(DummyMotorController::with_config(cfg)))
    }
}

/// Factory for [`DummyCounterTimerController`] (`type = "dummy_counter_timer"`).
pub struct DummyCounterTimerFactory;

impl ControllerFactory for DummyCounterTimerFactory {
    fn controller_type(&self) -> &'static str {
        "dummy_counter_timer"
    }

    fn name(&self) -> &'static str {
        "Dummy Counter/Timer Controller"
    }

    fn features(&self) -> ControllerFeatures {
        ControllerFeatures::COUNTER_TIMER
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let _: DummyCounterTimerConfig = config.clone().try_into()?;
        Ok(())
    }

    fn build(&self, config: toml::Value) -> Result<Box<dyn Controller>> {
        let cfg: DummyCounterTimerConfig = config.try_into()?;
        Ok(Box::new(DummyCounterTimerController::with_config(cfg)))
    }
}

/// Factory for [`DummyZeroDController`] (`type = "dummy_zerod"`).
pub struct DummyZeroDFactory;

impl ControllerFactory for DummyZeroDFactory {
    fn controller_type(&self) -> &'static str {
        "dummy_zerod"
    }

    fn name(&self) -> &'static str {
        "Dummy 0D Controller"
    }

    fn features(&self) -> ControllerFeatures {
        ControllerFeatures::ZERO_D
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: DummyZeroDConfig = config.clone().try_into()?;
        if cfg.noise < 0.0 {
            anyhow::bail!("noise must be >= 0");
        }
        Ok(())
    }

    fn build(&self, config: toml::Value) -> Result<Box<dyn Controller>> {
        let cfg: DummyZeroDConfig = config.try_into()?;
        Ok(Box::new(DummyZeroDController::with_config(cfg)))
    }
}

/// Trait for registries that can accept controller factories.
///
/// Keeps this crate independent of the application that owns the registry.
pub trait FactoryRegistry {
    fn register_factory(&self, factory: Box<dyn ControllerFactory>);
}

/// Register every dummy controller factory.
pub fn register_all(registry: &impl FactoryRegistry) {
    registry.register_factory(Box::new(DummyMotorFactory));
    registry.register_factory(Box::new(DummyCounterTimerFactory));
    registry.register_factory(Box::new(DummyZeroDFactory));
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Names(Mutex<Vec<&'static str>>);

    impl FactoryRegistry for Names {
        fn register_factory(&self, factory: Box<dyn ControllerFactory>) {
            self.0.lock().push(factory.controller_type());
        }
    }

    #[test]
    fn test_register_all() {
        let names = Names::default();
        register_all(&names);
        assert_eq!(
            *names.0.lock(),
            vec!["dummy_motor", "dummy_counter_timer", "dummy_zerod"]
        );
    }

    #[test]
    fn test_motor_factory_validation() {
        let ok: toml::Value = toml::from_str("settle_polls = 2").unwrap();
        assert!(DummyMotorFactory.validate(&ok).is_ok());

        let bad: toml::Value = toml::from_str("lower_limit = 5.0\nupper_limit = -5.0").unwrap();
        assert!(DummyMotorFactory.validate(&bad).is_err());

        let wrong_type: toml::Value = toml::from_str("settle_polls = \"three\"").unwrap();
        assert!(DummyMotorFactory.validate(&wrong_type).is_err());
    }

    #[test]
    fn test_factory_builds_controller() {
        let cfg: toml::Value = toml::from_str("base_value = 2.0").unwrap();
        let ctrl = DummyZeroDFactory.build(cfg).unwrap();
        assert_eq!(ctrl.controller_type(), "DummyZeroDController");
        assert!(ctrl.features().contains(ControllerFeatures::ZERO_D));
    }
}
