//! # Sardana Pool Application
//!
//! Application layer around the pool core: configuration loading, logging
//! setup and construction of a [`sardana_pool::Pool`] from a configuration
//! file. The `sardana` binary is a thin CLI over this library.
//!
//! ## Crate Structure
//!
//! - **`config`**: [`config::SardanaConfig`], loaded from TOML with
//!   `SARDANA_` environment overrides
//! - **`logging`**: tracing subscriber setup (pretty, compact or JSON)
//! - **`factory`**: controller factory registry and [`factory::build_pool`]
//!
//! The element model and the motion/acquisition actions live in the
//! `sardana-pool` crate; controller traits and shared types in `sardana-core`.

pub mod config;
pub mod factory;
pub mod logging;

pub use config::SardanaConfig;
pub use factory::{build_pool, ControllerRegistry};
