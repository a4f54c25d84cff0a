//! `robogate-hal` – Robot Adapter Layer
//!
//! The abstraction boundary between the gateway and concrete robots.  The
//! gateway only ever talks to the [`RobotAdapter`] trait, so robot families
//! (simulated, REST-driven, hardware-native) can be added by registering a
//! factory without touching the safety pipeline.
//!
//! # Modules
//!
//! - [`adapter`] – [`RobotAdapter`][adapter::RobotAdapter]: the capability
//!   interface every robot family implements.
//! - [`registry`] – [`AdapterRegistry`][registry::AdapterRegistry]: a
//!   name-keyed factory map plus one live adapter instance per robot ID.
//! - [`sim`] – [`SimulatedAdapter`][sim::SimulatedAdapter]: a reference
//!   adapter that fabricates odometry, LiDAR, IMU and battery data for
//!   development and tests.

pub mod adapter;
pub mod registry;
pub mod sim;

pub use adapter::{AdapterConfig, RobotAdapter};
pub use registry::{AdapterFactory, AdapterRegistry};
pub use sim::{SIMULATED_ADAPTER_TYPE, SimulatedAdapter};
