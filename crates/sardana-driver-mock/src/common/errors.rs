//! Error injection framework for the dummy controllers.
//!
//! Enables configurable failures and error scenarios for resilience testing.
//! Failures are raised as `sardana_core::ControllerError`, so the pool sees the
//! same structured errors a real driver would produce.

use super::rng::MockRng;
use parking_lot::Mutex;
use sardana_core::error::{ControllerError, ControllerErrorKind};
use std::collections::HashMap;
use std::sync::Arc;

/// Error injection configuration for dummy controllers
#[derive(Clone, Debug)]
pub struct ErrorConfig {
    /// Per-operation failure rate (0.0 to 1.0), `"*"` matches every operation
    failure_rates: Arc<HashMap<&'static str, f64>>,
    /// Specific failure scenarios
    scenarios: Arc<Vec<ErrorScenario>>,
    /// RNG for failure decisions
    rng: Arc<MockRng>,
    /// State tracking for scenarios
    state: Arc<Mutex<ErrorState>>,
}

#[derive(Debug, Clone)]
pub enum ErrorScenario {
    /// Fail every call after N successful ones
    FailAfterN {
        operation: &'static str,
        count: u32,
    },
    /// Fail the first N calls, then recover
    FailFirstN {
        operation: &'static str,
        count: u32,
    },
    /// Timeout on specific operation
    Timeout { operation: &'static str },
    /// Simulate communication loss (every later call fails)
    CommunicationLoss,
    /// Hardware fault with specific code (every later call fails)
    HardwareFault { code: u32 },
}

#[derive(Default, Debug)]
struct ErrorState {
    /// Operation counters for the counting scenarios
    operation_counts: HashMap<&'static str, u32>,
    /// Whether communication is lost
    communication_lost: bool,
    /// Hardware fault code (0 = no fault)
    hardware_fault_code: u32,
}

impl ErrorConfig {
    /// Create error config with no errors (default)
    pub fn none() -> Self {
        Self::build(HashMap::new(), Vec::new(), None)
    }

    /// Create error config with uniform random failures and an optional seed
    pub fn random_failures_seeded(rate: f64, seed: Option<u64>) -> Self {
        let mut rates = HashMap::new();
        rates.insert("*", rate);
        Self::build(rates, Vec::new(), seed)
    }

    /// Create error config with a single scenario
    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    /// Create error config with multiple scenarios
    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self::build(HashMap::new(), scenarios, None)
    }

    /// Create error config with custom failure rates per operation
    pub fn with_rates(rates: HashMap<&'static str, f64>, seed: Option<u64>) -> Self {
        Self::build(rates, Vec::new(), seed)
    }

    fn build(
        rates: HashMap<&'static str, f64>,
        scenarios: Vec<ErrorScenario>,
        seed: Option<u64>,
    ) -> Self {
        Self {
            failure_rates: Arc::new(rates),
            scenarios: Arc::new(scenarios),
            rng: Arc::new(MockRng::new(seed)),
            state: Arc::new(Mutex::new(ErrorState::default())),
        }
    }

    /// Check if an operation should fail and return the matching error
    pub fn check_operation(
        &self,
        controller_type: &str,
        operation: &'static str,
    ) -> Result<(), ControllerError> {
        let mut state = self.state.lock();

        if state.communication_lost {
            return Err(ControllerError::new(
                controller_type,
                ControllerErrorKind::Communication,
                "Communication lost",
            ));
        }

        if state.hardware_fault_code != 0 {
            return Err(ControllerError::new(
                controller_type,
                ControllerErrorKind::Hardware,
                format!("Hardware fault: {}", state.hardware_fault_code),
            ));
        }

        for scenario in self.scenarios.iter() {
            match scenario {
                ErrorScenario::FailAfterN {
                    operation: op,
                    count,
                } if *op == operation => {
                    let current = state.operation_counts.entry(operation).or_insert(0);
                    *current += 1;
                    if *current > *count {
                        return Err(ControllerError::new(
                            controller_type,
                            ControllerErrorKind::Hardware,
                            format!("Injected failure after {} operations", count),
                        ));
                    }
                }
                ErrorScenario::FailFirstN {
                    operation: op,
                    count,
                } if *op == operation => {
                    let current = state.operation_counts.entry(operation).or_insert(0);
                    *current += 1;
                    if *current <= *count {
                        return Err(ControllerError::new(
                            controller_type,
                            ControllerErrorKind::Communication,
                            format!("Connection error on '{}'", operation),
                        ));
                    }
                }
                ErrorScenario::Timeout { operation: op } if *op == operation => {
                    return Err(ControllerError::new(
                        controller_type,
                        ControllerErrorKind::Timeout,
                        format!("Operation '{}' timed out", operation),
                    ));
                }
                ErrorScenario::CommunicationLoss => {
                    // Only trigger on first occurrence
                    if !state.communication_lost {
                        state.communication_lost = true;
                        return Err(ControllerError::new(
                            controller_type,
                            ControllerErrorKind::Communication,
                            "Communication lost",
                        ));
                    }
                }
                ErrorScenario::HardwareFault { code } => {
                    // Only trigger on first occurrence
                    if state.hardware_fault_code == 0 {
                        state.hardware_fault_code = *code;
                        return Err(ControllerError::new(
                            controller_type,
                            ControllerErrorKind::Hardware,
                            format!("Hardware fault: {}", code),
                        ));
                    }
                }
                _ => {}
            }
        }

        let rate = self
            .failure_rates
            .get(operation)
            .or_else(|| self.failure_rates.get("*"))
            .copied()
            .unwrap_or(0.0);

        if self.rng.should_fail(rate) {
            return Err(ControllerError::new(
                controller_type,
                ControllerErrorKind::Hardware,
                format!("Random failure on operation '{}'", operation),
            ));
        }

        Ok(())
    }

    /// True once a communication loss scenario has triggered.
    pub fn is_communication_lost(&self) -> bool {
        self.state.lock().communication_lost
    }

    /// Reset error state (clear counters, faults)
    pub fn reset(&self) {
        *self.state.lock() = ErrorState::default();
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self::none()
    }
}
