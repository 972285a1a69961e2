//! `sardana-core`
//!
//! Core types and traits shared by the sardana device pool and its controller
//! drivers.
//!
//! ## Key Types
//!
//! - [`State`]: the state enumeration reported by controllers and elements
//! - [`Controller`]: the axis-oriented driver contract every controller implements
//! - [`SardanaAttribute`]: a cached, timestamped, filtered attribute that fires events
//! - [`EventGenerator`]: weak-listener publish/subscribe primitive
//! - [`PoolError`]: the typed error of the pool
//!
//! Controllers speak in raw axis terms (1-based axis numbers, dial values). The
//! `sardana-pool` crate turns those raw tuples into element state and events.

pub mod attribute;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod state;

pub use attribute::{
    filters, AttributeValue, ErrorInfo, Filter, SardanaAttribute, SardanaSoftwareAttribute,
    SardanaValue,
};
pub use config::PoolConfig;
pub use controller::{
    limit_switches, Axis, Controller, ControllerFactory, ControllerFeatures, StateInfo,
};
pub use error::{ControllerError, ControllerErrorKind, PoolError, PoolResult};
pub use event::{
    ChannelListener, Event, EventGenerator, EventListener, EventType, EventValue, Propagate,
    RecordingListener, SubscriptionId,
};
pub use state::{ControllerId, ElementId, ElementType, State};

// Re-export commonly used types
pub use anyhow::{anyhow, Result};
pub use async_trait::async_trait;
