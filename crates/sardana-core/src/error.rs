//! Error types for the device pool.
//!
//! Two layers of errors exist:
//!
//! - **`ControllerError`**: a structured failure raised by a controller driver.
//!   Drivers return `anyhow::Result` from their trait methods, so a
//!   `ControllerError` usually travels inside an `anyhow::Error` and can be
//!   recovered with `downcast_ref`.
//! - **`PoolError`**: the typed error returned by pool operations (starting a
//!   motion, looking up an element, loading a counter). Driver failures that
//!   escape an operation are wrapped in [`PoolError::Driver`] with the name of
//!   the controller that raised them.
//!
//! Failures of a controller while *reading state* never surface as a
//! `PoolError`; they are contained per controller and reported in-band as a
//! Fault state with the formatted error chain in the status text.

use crate::controller::Axis;
use thiserror::Error;

// =============================================================================
// Controller Errors
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerErrorKind {
    Communication,
    Timeout,
    Hardware,
    Configuration,
    InvalidAxis,
    Unknown,
}

impl std::fmt::Display for ControllerErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ControllerErrorKind::Communication => "communication",
            ControllerErrorKind::Timeout => "timeout",
            ControllerErrorKind::Hardware => "hardware",
            ControllerErrorKind::Configuration => "configuration",
            ControllerErrorKind::InvalidAxis => "invalid_axis",
            ControllerErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

#[derive(Error, Debug, Clone)]
#[error("Controller '{controller_type}' {kind} error: {message}")]
pub struct ControllerError {
    pub controller_type: String,
    pub kind: ControllerErrorKind,
    pub message: String,
}

impl ControllerError {
    pub fn new(
        controller_type: impl Into<String>,
        kind: ControllerErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            controller_type: controller_type.into(),
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for an axis that the controller does not know about.
    pub fn invalid_axis(controller_type: impl Into<String>, axis: Axis) -> Self {
        Self::new(
            controller_type,
            ControllerErrorKind::InvalidAxis,
            format!("axis {} is not defined", axis),
        )
    }

    /// True when the failure means the controller cannot be reached.
    pub fn is_communication(&self) -> bool {
        matches!(
            self.kind,
            ControllerErrorKind::Communication | ControllerErrorKind::Timeout
        )
    }
}

/// Convenience alias for results using the pool error type.
pub type PoolResult<T> = std::result::Result<T, PoolError>;

/// Primary error type of the device pool.
///
/// # Error Categories
///
/// 1. **Lookup errors**: `ElementNotFound`, `ControllerNotFound`, `DuplicateName`
///    - Raised by the pool registry and by actions asked about unknown elements
/// 2. **Start errors**: `PreStartOneFailed`, `PreLoadOneFailed`, `Driver`
///    - Raised synchronously while an action is being started; nothing is
///      committed when a pre-start check refuses
/// 3. **Usage errors**: `AlreadyInOperation`, `ActionBusy`, `InvalidIntegrationTime`,
///    `InvalidParameter`, `MissingCapability`
///    - The caller asked for something the current state does not allow
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Element '{0}' not found")]
    ElementNotFound(String),

    #[error("Controller '{0}' not found")]
    ControllerNotFound(String),

    #[error("Name '{0}' is already in use")]
    DuplicateName(String),

    #[error("{0} is already involved in an operation")]
    AlreadyInOperation(String),

    #[error("Action '{0}' is running; elements cannot be added or removed")]
    ActionBusy(String),

    #[error("{controller}.PreStartOne({element}({axis}), {target}) returns False")]
    PreStartOneFailed {
        controller: String,
        element: String,
        axis: Axis,
        target: f64,
    },

    #[error("{controller}.PreLoadOne({axis}, {value}) returns False")]
    PreLoadOneFailed {
        controller: String,
        axis: Axis,
        value: f64,
    },

    #[error("Invalid integration_time '{0}'. Hint set a new value for 'value' first")]
    InvalidIntegrationTime(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Controller '{controller}' is offline: {reason}")]
    ControllerOffline { controller: String, reason: String },

    #[error("Controller '{controller}' does not support {capability}")]
    MissingCapability {
        controller: String,
        capability: String,
    },

    #[error("Controller '{controller}' error in {operation}: {source}")]
    Driver {
        controller: String,
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error("{element}: value in error: {message}")]
    ValueError { element: String, message: String },

    #[error("{operation} failed on {} controller(s)", .errors.len())]
    OperationFailed {
        operation: &'static str,
        errors: Vec<PoolError>,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl PoolError {
    /// Wraps a driver failure raised during `operation` on `controller`.
    pub fn driver(
        controller: impl Into<String>,
        operation: &'static str,
        source: anyhow::Error,
    ) -> Self {
        PoolError::Driver {
            controller: controller.into(),
            operation,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_error_display() {
        let err = ControllerError::new(
            "dummy_motor",
            ControllerErrorKind::Communication,
            "connection reset",
        );
        assert_eq!(
            err.to_string(),
            "Controller 'dummy_motor' communication error: connection reset"
        );
        assert!(err.is_communication());
    }

    #[test]
    fn test_controller_error_through_anyhow() {
        let err: anyhow::Error = ControllerError::invalid_axis("dummy_motor", 9).into();
        let inner = err.downcast_ref::<ControllerError>();
        assert_eq!(inner.map(|e| e.kind), Some(ControllerErrorKind::InvalidAxis));
    }

    #[test]
    fn test_pre_start_one_message_names_axis_and_target() {
        let err = PoolError::PreStartOneFailed {
            controller: "motctrl01".into(),
            element: "mot1".into(),
            axis: 1,
            target: 10.0,
        };
        assert_eq!(
            err.to_string(),
            "motctrl01.PreStartOne(mot1(1), 10) returns False"
        );
    }

    #[test]
    fn test_integration_time_hint() {
        let err = PoolError::InvalidIntegrationTime("None".into());
        assert!(err
            .to_string()
            .contains("Hint set a new value for 'value' first"));
    }

    #[test]
    fn test_operation_failed_counts_errors() {
        let err = PoolError::OperationFailed {
            operation: "abort",
            errors: vec![
                PoolError::ControllerNotFound("a".into()),
                PoolError::ControllerNotFound("b".into()),
            ],
        };
        assert_eq!(err.to_string(), "abort failed on 2 controller(s)");
    }
}
