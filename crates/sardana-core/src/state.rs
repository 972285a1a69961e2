//! State enumeration and element identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a controller axis or a pool element.
///
/// Mirrors the device states used by the control system. `Moving` and
/// `Running` are the in-progress states; every other state means the axis is
/// not currently executing an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum State {
    On,
    Off,
    Close,
    Open,
    Insert,
    Extract,
    Moving,
    Standby,
    Fault,
    Init,
    Running,
    Alarm,
    Disable,
    #[default]
    Unknown,
    Invalid,
}

impl State {
    /// True for the states that mean an operation is still in progress.
    pub fn is_moving(self) -> bool {
        matches!(self, State::Moving | State::Running)
    }

    /// True for states reporting a problem with the device.
    pub fn is_error(self) -> bool {
        matches!(self, State::Fault | State::Alarm | State::Unknown)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::On => "On",
            State::Off => "Off",
            State::Close => "Close",
            State::Open => "Open",
            State::Insert => "Insert",
            State::Extract => "Extract",
            State::Moving => "Moving",
            State::Standby => "Standby",
            State::Fault => "Fault",
            State::Init => "Init",
            State::Running => "Running",
            State::Alarm => "Alarm",
            State::Disable => "Disable",
            State::Unknown => "Unknown",
            State::Invalid => "Invalid",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pool-wide unique identifier of an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ElementId(pub u64);

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pool-wide unique identifier of a controller.
///
/// Controllers are always visited in ascending id order when an action needs
/// to touch more than one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ControllerId(pub u64);

impl fmt::Display for ControllerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of pool element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    Motor,
    CTExpChannel,
    ZeroDExpChannel,
    MotorGroup,
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ElementType::Motor => "Motor",
            ElementType::CTExpChannel => "CTExpChannel",
            ElementType::ZeroDExpChannel => "ZeroDExpChannel",
            ElementType::MotorGroup => "MotorGroup",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_moving_states() {
        assert!(State::Moving.is_moving());
        assert!(State::Running.is_moving());
        assert!(!State::On.is_moving());
        assert!(!State::Fault.is_moving());
    }

    #[test]
    fn test_display() {
        assert_eq!(State::Fault.to_string(), "Fault");
        assert_eq!(ElementType::ZeroDExpChannel.to_string(), "ZeroDExpChannel");
        assert_eq!(ElementId(7).to_string(), "7");
    }

    #[test]
    fn test_controller_ids_order() {
        let mut ids = vec![ControllerId(3), ControllerId(1), ControllerId(2)];
        ids.sort();
        assert_eq!(ids, vec![ControllerId(1), ControllerId(2), ControllerId(3)]);
    }
}
