//! Controller factories and pool construction from configuration.
//!
//! [`ControllerRegistry`] maps a configuration `type` string to the
//! [`ControllerFactory`] that builds it. [`build_pool`] walks a validated
//! [`SardanaConfig`] and creates the controllers, axis elements and motor
//! groups it describes, in that order.

use crate::config::{ElementKind, SardanaConfig};
use anyhow::{anyhow, Context, Result};
use dashmap::DashMap;
use sardana_core::{Controller, ControllerFactory};
use sardana_driver_mock::FactoryRegistry;
use sardana_pool::{Pool, WorkerPool};
use tracing::{info, warn};

/// Factory description for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactoryInfo {
    pub controller_type: String,
    pub name: String,
    pub features: String,
}

#[derive(Default)]
pub struct ControllerRegistry {
    factories: DashMap<String, Box<dyn ControllerFactory>>,
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in factory.
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        sardana_driver_mock::register_all(&registry);
        registry
    }

    /// Registers `factory`, returning the one it replaced.
    pub fn register(&self, factory: Box<dyn ControllerFactory>) -> Option<Box<dyn ControllerFactory>> {
        let controller_type = factory.controller_type().to_string();
        info!(
            controller_type = %controller_type,
            name = %factory.name(),
            features = ?factory.features(),
            "Registering controller factory"
        );
        self.factories.insert(controller_type, factory)
    }

    pub fn has_factory(&self, controller_type: &str) -> bool {
        self.factories.contains_key(controller_type)
    }

    /// Registered types, sorted.
    pub fn list_factories(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .factories
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        types.sort();
        types
    }

    pub fn factory_info(&self, controller_type: &str) -> Option<FactoryInfo> {
        self.factories.get(controller_type).map(|entry| {
            let factory = entry.value();
            FactoryInfo {
                controller_type: factory.controller_type().to_string(),
                name: factory.name().to_string(),
                features: format!("{:?}", factory.features()),
            }
        })
    }

    /// Validates `config` with the factory registered for `controller_type`.
    pub fn validate(&self, controller_type: &str, config: &toml::Value) -> Result<()> {
        let factory = self
            .factories
            .get(controller_type)
            .ok_or_else(|| anyhow!("No factory registered for controller type '{}'", controller_type))?;
        factory.value().validate(config)
    }

    pub fn build(&self, controller_type: &str, config: toml::Value) -> Result<Box<dyn Controller>> {
        let factory = self
            .factories
            .get(controller_type)
            .ok_or_else(|| anyhow!("No factory registered for controller type '{}'", controller_type))?;
        factory.value().validate(&config)?;
        factory.value().build(config)
    }
}

impl FactoryRegistry for ControllerRegistry {
    fn register_factory(&self, factory: Box<dyn ControllerFactory>) {
        if let Some(previous) = self.register(factory) {
            warn!(
                controller_type = previous.controller_type(),
                "controller factory replaced"
            );
        }
    }
}

/// Checks every enabled controller table against its factory without
/// building anything.
pub fn check_controllers(registry: &ControllerRegistry, config: &SardanaConfig) -> Result<()> {
    for ctrl in config.controllers.iter().filter(|c| c.enabled) {
        registry
            .validate(&ctrl.r#type, &ctrl.config)
            .with_context(|| format!("controller '{}'", ctrl.name))?;
    }
    Ok(())
}

/// Builds a pool from `config` on the current tokio runtime.
///
/// The configuration is validated first. A controller that fails to build
/// aborts the whole construction; an element whose `AddDevice` fails is
/// still created and leaves its controller offline.
pub async fn build_pool(registry: &ControllerRegistry, config: &SardanaConfig) -> Result<Pool> {
    config.validate().map_err(|e| anyhow!(e))?;

    let worker_pool = WorkerPool::current(config.pool.worker_threads)?;
    let pool = Pool::new(config.pool.clone(), worker_pool);

    for ctrl in &config.controllers {
        if !ctrl.enabled {
            info!(controller = %ctrl.name, "controller disabled, skipping");
            continue;
        }
        let driver = registry
            .build(&ctrl.r#type, ctrl.config.clone())
            .with_context(|| format!("failed to build controller '{}'", ctrl.name))?;
        pool.add_controller(ctrl.name.clone(), driver)?;
    }

    for element in &config.elements {
        let (name, ctrl, axis) = (element.name.as_str(), element.controller.as_str(), element.axis);
        match element.kind {
            ElementKind::Motor => {
                pool.add_motor(name, ctrl, axis).await?;
            }
            ElementKind::CtExpChannel => {
                pool.add_ct_channel(name, ctrl, axis).await?;
            }
            ElementKind::ZerodExpChannel => {
                pool.add_zerod_channel(name, ctrl, axis).await?;
            }
        }
    }

    for group in &config.motor_groups {
        let members: Vec<&str> = group.motors.iter().map(String::as_str).collect();
        pool.add_motor_group(group.name.as_str(), &members)?;
    }

    let offline: Vec<_> = pool
        .controllers()
        .into_iter()
        .filter(|c| !c.is_online())
        .map(|c| c.name().to_string())
        .collect();
    if !offline.is_empty() {
        warn!(controllers = ?offline, "pool started with offline controllers");
    }
    info!(
        controllers = pool.controllers().len(),
        elements = pool.elements().len(),
        "pool ready"
    );
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_factories() {
        let registry = ControllerRegistry::with_builtin();
        assert_eq!(
            registry.list_factories(),
            vec!["dummy_counter_timer", "dummy_motor", "dummy_zerod"]
        );
        let info = registry.factory_info("dummy_motor").unwrap();
        assert_eq!(info.name, "Dummy Motor Controller");
        assert!(info.features.contains("MOTOR"));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let registry = ControllerRegistry::with_builtin();
        let err = registry
            .build("stepper_9000", toml::Value::Table(Default::default()))
            .err()
            .unwrap();
        assert!(err.to_string().contains("stepper_9000"));
    }

    #[test]
    fn test_build_validates_first() {
        let registry = ControllerRegistry::with_builtin();
        let bad: toml::Value = toml::from_str("lower_limit = 1.0\nupper_limit = 0.0").unwrap();
        assert!(registry.build("dummy_motor", bad).is_err());
    }
}
