//! Application configuration.
//!
//! Loaded from a TOML file with environment overrides layered on top:
//!
//! ```toml
//! [application]
//! name = "sardana"
//! log_level = "info"
//!
//! [pool]
//! motion_loop_sleep_ms = 10
//!
//! [[controllers]]
//! name = "motctrl01"
//! type = "dummy_motor"
//! [controllers.config]
//! settle_polls = 3
//!
//! [[elements]]
//! name = "mot01"
//! kind = "motor"
//! controller = "motctrl01"
//! axis = 1
//! ```
//!
//! Environment variables use the `SARDANA_` prefix with `__` separating
//! nested keys, e.g. `SARDANA_POOL__MOTION_LOOP_SLEEP_MS=5`.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use sardana_core::PoolConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

pub const ENV_PREFIX: &str = "SARDANA_";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SardanaConfig {
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub controllers: Vec<ControllerDefinition>,
    #[serde(default)]
    pub elements: Vec<ElementDefinition>,
    #[serde(default)]
    pub motor_groups: Vec<GroupDefinition>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApplicationConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

fn default_name() -> String {
    "sardana".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_controller_config() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

/// A controller instance: the factory `type` plus its own config table.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerDefinition {
    pub name: String,
    pub r#type: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_controller_config")]
    pub config: toml::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Motor,
    CtExpChannel,
    ZerodExpChannel,
}

/// An axis element bound to one controller axis (1-based).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ElementDefinition {
    pub name: String,
    pub kind: ElementKind,
    pub controller: String,
    pub axis: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GroupDefinition {
    pub name: String,
    pub motors: Vec<String>,
}

impl SardanaConfig {
    /// Load configuration from `path` with environment overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }

    /// Load from the default location (`config/sardana.toml`).
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from("config/sardana.toml")
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        self.pool.validate()?;

        // Controllers, elements and groups share one case-insensitive namespace
        let mut names = HashSet::new();
        let mut claim = |name: &str| -> Result<(), String> {
            if !names.insert(name.to_lowercase()) {
                return Err(format!("Duplicate name: {}", name));
            }
            Ok(())
        };

        let mut controllers = HashSet::new();
        for ctrl in &self.controllers {
            claim(&ctrl.name)?;
            if ctrl.enabled {
                controllers.insert(ctrl.name.to_lowercase());
            }
        }

        let mut axes = HashSet::new();
        let mut motors = HashSet::new();
        for element in &self.elements {
            claim(&element.name)?;
            if !controllers.contains(&element.controller.to_lowercase()) {
                return Err(format!(
                    "Element '{}' references unknown or disabled controller '{}'",
                    element.name, element.controller
                ));
            }
            if element.axis == 0 {
                return Err(format!(
                    "Element '{}': axis numbers start at 1",
                    element.name
                ));
            }
            if !axes.insert((element.controller.to_lowercase(), element.axis)) {
                return Err(format!(
                    "Element '{}': axis {} of '{}' is already in use",
                    element.name, element.axis, element.controller
                ));
            }
            if element.kind == ElementKind::Motor {
                motors.insert(element.name.to_lowercase());
            }
        }

        for group in &self.motor_groups {
            claim(&group.name)?;
            if group.motors.is_empty() {
                return Err(format!("Motor group '{}' has no members", group.name));
            }
            for motor in &group.motors {
                if !motors.contains(&motor.to_lowercase()) {
                    return Err(format!(
                        "Motor group '{}' references unknown motor '{}'",
                        group.name, motor
                    ));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn motor(name: &str, controller: &str, axis: u32) -> ElementDefinition {
        ElementDefinition {
            name: name.to_string(),
            kind: ElementKind::Motor,
            controller: controller.to_string(),
            axis,
        }
    }

    fn controller(name: &str) -> ControllerDefinition {
        ControllerDefinition {
            name: name.to_string(),
            r#type: "dummy_motor".to_string(),
            enabled: true,
            config: default_controller_config(),
        }
    }

    #[test]
    fn test_default_is_valid() {
        let config = SardanaConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.application.log_level, "info");
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = SardanaConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().unwrap_err().contains("Invalid log_level"));
    }

    #[test]
    fn test_duplicate_names_across_kinds() {
        let config = SardanaConfig {
            controllers: vec![controller("motctrl01")],
            elements: vec![motor("MOTCTRL01", "motctrl01", 1)],
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().contains("Duplicate name"));
    }

    #[test]
    fn test_element_checks() {
        let unknown = SardanaConfig {
            controllers: vec![controller("motctrl01")],
            elements: vec![motor("mot01", "motctrl02", 1)],
            ..Default::default()
        };
        assert!(unknown.validate().unwrap_err().contains("unknown or disabled"));

        let axis_zero = SardanaConfig {
            controllers: vec![controller("motctrl01")],
            elements: vec![motor("mot01", "motctrl01", 0)],
            ..Default::default()
        };
        assert!(axis_zero.validate().unwrap_err().contains("start at 1"));

        let reused = SardanaConfig {
            controllers: vec![controller("motctrl01")],
            elements: vec![motor("mot01", "motctrl01", 1), motor("mot02", "motctrl01", 1)],
            ..Default::default()
        };
        assert!(reused.validate().unwrap_err().contains("already in use"));
    }

    #[test]
    fn test_group_members_must_be_motors() {
        let config = SardanaConfig {
            controllers: vec![controller("motctrl01")],
            elements: vec![motor("mot01", "motctrl01", 1)],
            motor_groups: vec![GroupDefinition {
                name: "mg01".to_string(),
                motors: vec!["mot01".to_string(), "mot02".to_string()],
            }],
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().contains("unknown motor 'mot02'"));
    }

    #[test]
    fn test_invalid_pool_section() {
        let mut config = SardanaConfig::default();
        config.pool.acq_loop_sleep_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_from_toml() {
        let text = r#"
            [[controllers]]
            name = "ctctrl01"
            type = "dummy_counter_timer"

            [[elements]]
            name = "ct01"
            kind = "ct_exp_channel"
            controller = "ctctrl01"
            axis = 1
        "#;
        let config: SardanaConfig = toml::from_str(text).unwrap();
        assert!(config.controllers[0].enabled);
        assert!(config.controllers[0].config.is_table());
        assert_eq!(config.elements[0].kind, ElementKind::CtExpChannel);
        assert!(config.validate().is_ok());
    }
}
