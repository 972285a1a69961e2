//! Motion and acquisition coordination for the sardana device pool.
//!
//! This crate turns raw controller calls into element state. It owns the
//! element model (motors, groups, counter/timer and 0D channels), the actions
//! that drive them across several controllers at once, and the [`Pool`]
//! registry tying everything together.
//!
//! # Key Design: one batched call sequence per controller
//!
//! Every multi-element operation is grouped by controller and each group is
//! issued as one ordered sequence (`PreStateAll`, `PreStateOne`×n, `StateAll`,
//! `StateOne`×n and the matching read, start and load sequences). Groups run
//! concurrently on the [`WorkerPool`]; calls into a single controller are
//! serialized by its lock. A failing controller faults its own elements only.
//!
//! # Actions
//!
//! - [`PoolMotion`]: ordered start of several motors, then a polling loop with
//!   backlash and instability handling
//! - [`PoolCTAcquisition`]: preset load and master-last start of counter/timers
//! - [`Pool0DAcquisition`]: sampling loop feeding each channel's accumulation
//! - [`PoolAcquisition`]: counter/timers with 0D slaves
//!
//! # Example
//!
//! ```
//! use sardana_core::PoolConfig;
//! use sardana_driver_mock::DummyMotorController;
//! use sardana_pool::{Pool, WorkerPool};
//!
//! # tokio_test::block_on(async {
//! let pool = Pool::new(
//!     PoolConfig::default(),
//!     WorkerPool::current(4).unwrap(),
//! );
//! pool.add_controller("motctrl01", Box::new(DummyMotorController::new())).unwrap();
//! let motor = pool.add_motor("mot01", "motctrl01", 1).await.unwrap();
//!
//! motor.move_to(2.5).await.unwrap();
//! assert_eq!(motor.cached_position(), Some(2.5));
//! # });
//! ```

pub mod accumulation;
pub mod acquisition;
pub mod action;
pub mod channel;
pub mod ct_acquisition;
pub mod element;
pub mod executor;
pub mod motion;
pub mod motor;
pub mod motor_group;
pub mod pool;
pub mod pool_controller;
pub mod zerod;

pub use accumulation::{Accumulation, AccumulationType};
pub use acquisition::{AcquisitionRequest, PoolAcquisition};
pub use action::{Action, PoolAction};
pub use channel::{BaseChannel, PoolCTExpChannel};
pub use ct_acquisition::{AcquisitionMode, CTAcquisitionItems, PoolCTAcquisition};
pub use element::{ElementCore, OperationToken, PoolElement};
pub use executor::{OperationGuard, OperationInfo, WorkerPool};
pub use motion::{
    BacklashStrategy, MotionItems, MotionState, MotionTarget, MoveToBacklashPosition, PoolMotion,
};
pub use motor::PoolMotor;
pub use motor_group::{group_state, PoolMotorGroup};
pub use pool::{Pool, PoolElementRef};
pub use pool_controller::PoolController;
pub use zerod::{Pool0DAcquisition, Pool0DExpChannel, ZeroDAcquisitionItems};
