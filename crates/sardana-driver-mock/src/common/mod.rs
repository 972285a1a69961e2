//! Common infrastructure for the dummy controllers.
//!
//! - **mode**: Operational modes (Instant, Realistic, Chaos)
//! - **timing**: Hardware-like delays for realistic mode
//! - **errors**: Error injection framework
//! - **rng**: Seeded random number generator
//! - **calls**: Recorded controller calls, for asserting call ordering

pub mod calls;
pub mod errors;
pub mod mode;
pub mod rng;
pub mod timing;

// Re-export commonly used types
pub use calls::{CallLog, ControllerCall};
pub use errors::{ErrorConfig, ErrorScenario};
pub use mode::MockMode;
pub use rng::MockRng;
pub use timing::TimingConfig;
